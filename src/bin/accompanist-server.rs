//! Accompanist HTTP server.
//!
//! Loads the models once, then serves `POST /generate` and `GET /health`.
//!
//! ```sh
//! curl -F audio_file=@vocals.wav -F duration=4 -OJ http://localhost:8000/generate
//! ```

use std::path::PathBuf;

use accompanist_rs::{
    config::{CheckpointPaths, ModelConfig, ServiceConfig},
    manager::{GenerationManager, ManagerConfig},
    server,
};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "accompanist-server",
    about = "Accompaniment generation over HTTP"
)]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Directory holding the model checkpoints.
    #[arg(long, default_value = "weights")]
    weights_dir: PathBuf,

    /// Base model document (JSON). Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Semantic-from-vocal model document (JSON).
    #[arg(long)]
    semcoarsetosem_config: Option<PathBuf>,

    /// Evaluation archive directory.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Scratch directory for per-request files.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Requests allowed to run the pipeline at the same time.
    #[arg(long, default_value_t = 4)]
    max_concurrent: usize,

    /// Largest accepted request body in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    max_upload_bytes: usize,

    /// Run the three token extractions one after another.
    #[arg(long, default_value_t = false)]
    sequential_extraction: bool,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, default_value_t = 0)]
    cuda_device: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("accompanist_rs=info,tower_http=info,info")
            }),
        )
        .init();

    let args = Args::parse();

    let model =
        ModelConfig::from_documents(args.config.as_deref(), args.semcoarsetosem_config.as_deref())?;
    let defaults = ServiceConfig::default();
    let service = ServiceConfig {
        work_dir: args.work_dir.unwrap_or(defaults.work_dir),
        archive_dir: args.archive_dir.unwrap_or(defaults.archive_dir),
        max_concurrent_requests: args.max_concurrent,
        max_upload_bytes: args.max_upload_bytes,
        parallel_extraction: !args.sequential_extraction,
    };
    info!(
        work_dir = %service.work_dir.display(),
        archive_dir = %service.archive_dir.display(),
        "starting accompaniment server"
    );

    let manager = GenerationManager::start(ManagerConfig {
        cuda_device: args.cuda_device,
        model,
        checkpoints: CheckpointPaths::in_dir(&args.weights_dir),
        service: service.clone(),
    })
    .await?;

    let app = server::router(manager, service.max_upload_bytes);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
