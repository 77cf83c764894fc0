//! HTTP boundary.
//!
//! - `POST /generate`: multipart upload (`audio_file` or `file`) plus
//!   optional form fields; answers with the generated WAV as an attachment.
//! - `GET /health`: liveness probe.

pub mod error;

use std::fmt::Display;
use std::str::FromStr;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State, multipart::Field, multipart::MultipartRejection},
    http::{Response, StatusCode, header},
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;

use crate::Error;
use crate::manager::GenerationManager;
use crate::request::{GenerationParameters, UploadedAudio};

pub use error::ApiError;

/// Build the service router.
pub fn router(manager: GenerationManager, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn generate(
    State(manager): State<GenerationManager>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response<Body>, ApiError> {
    let multipart =
        multipart.map_err(|e| ApiError::bad_request(format!("Invalid multipart payload: {e}")))?;
    let (upload, params) = read_form(multipart).await?;

    let outcome = manager.generate(upload, params).await?;

    let path = outcome.output_path().to_path_buf();
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| Error::storage(&path, e))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| Error::storage(&path, e))?
        .len();
    let disposition = format!("attachment; filename={}", outcome.file_name());
    let request_id = outcome.request_id().to_string();

    // The stream owns the outcome, so the scratch tree outlives the body.
    let body = ReaderStream::new(file).map(move |chunk| {
        let _outcome = &outcome;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/wav")
        .header(header::CONTENT_LENGTH, len)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header("x-request-id", request_id)
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}

/// Pull the upload and parameters out of the form. Absent fields keep their
/// defaults; unknown fields are ignored.
async fn read_form(
    mut multipart: Multipart,
) -> Result<(UploadedAudio, GenerationParameters), ApiError> {
    let mut upload: Option<UploadedAudio> = None;
    let mut params = GenerationParameters::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio_file" | "file" => {
                let filename = field.file_name().unwrap_or("input.wav").to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed reading multipart '{name}' field: {e}"))
                })?;
                if bytes.is_empty() {
                    return Err(ApiError::bad_request(format!(
                        "Multipart '{name}' field is empty"
                    )));
                }
                upload = Some(UploadedAudio::new(filename, bytes.to_vec()));
            }
            "semantic_steps" => params.semantic_steps = parse_field(field).await?,
            "duration" => params.duration_seconds = parse_field(field).await?,
            "time_steps_factor" => params.time_steps_factor = parse_field(field).await?,
            "temperature" => params.temperature = parse_field(field).await?,
            "prompt" => params.prompt = field_text(field).await?,
            "save_for_eval" => {
                params.save_for_eval = parse_bool(&name, &field_text(field).await?)?
            }
            "seed" => params.seed = Some(parse_field(field).await?),
            _ => tracing::debug!(field = %name, "ignoring unknown form field"),
        }
    }

    let upload = upload.ok_or_else(|| {
        ApiError::bad_request("Missing audio upload (expected 'audio_file' file field)")
    })?;
    Ok((upload, params))
}

async fn field_text(field: Field<'_>) -> Result<String, ApiError> {
    let name = field.name().unwrap_or_default().to_string();
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart '{name}' field: {e}")))
}

async fn parse_field<T>(field: Field<'_>) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    let name = field.name().unwrap_or_default().to_string();
    let text = field_text(field).await?;
    parse_value(&name, &text)
}

fn parse_value<T>(name: &str, text: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: Display,
{
    text.trim()
        .parse()
        .map_err(|e| ApiError::bad_request(format!("Invalid value {text:?} for '{name}': {e}")))
}

/// Form booleans as browsers and HTTP clients send them.
fn parse_bool(name: &str, text: &str) -> Result<bool, ApiError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ApiError::bad_request(format!(
            "Invalid value {text:?} for '{name}': expected a boolean"
        ))),
    }
}
