//! Generation manager: keeps the models resident and runs requests.
//!
//! The manager loads the five model handles once and shares one
//! [`Pipeline`] across callers. Each request takes a permit from a
//! semaphore (bounding how many run at once) and then runs the synchronous
//! pipeline on tokio's blocking pool.
//!
//! The permit travels with the blocking task, not the caller: if the
//! caller goes away mid-request the pipeline still runs to completion and
//! the dropped outcome removes its scratch tree.
//!
//! # Example
//!
//! ```no_run
//! use accompanist_rs::manager::{GenerationManager, ManagerConfig};
//! use accompanist_rs::request::{GenerationParameters, UploadedAudio};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = GenerationManager::start(ManagerConfig::default()).await.unwrap();
//!     let upload = UploadedAudio::new("vocals.wav", std::fs::read("vocals.wav").unwrap());
//!     let outcome = manager
//!         .generate(upload, GenerationParameters::default())
//!         .await
//!         .unwrap();
//!     println!("{}", outcome.output_path().display());
//! }
//! ```

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::{CheckpointPaths, ModelConfig, ServiceConfig};
use crate::model::registry::ModelRegistry;
use crate::model::{ModelSet, preferred_device};
use crate::pipeline::{GenerationOutcome, Pipeline};
use crate::request::{GenerationParameters, RequestId, UploadedAudio};
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// CUDA device ordinal (0 = first GPU). Ignored when CUDA is unavailable.
    pub cuda_device: usize,
    pub model: ModelConfig,
    pub checkpoints: CheckpointPaths,
    pub service: ServiceConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cuda_device: 0,
            model: ModelConfig::default(),
            checkpoints: CheckpointPaths::in_dir("weights"),
            service: ServiceConfig::default(),
        }
    }
}

/// Handle for submitting generation requests. Cheap to clone.
#[derive(Clone)]
pub struct GenerationManager {
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
}

impl GenerationManager {
    /// Load the models and return a handle for submitting requests.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        let ManagerConfig {
            cuda_device,
            model,
            checkpoints,
            service,
        } = config;

        let pipeline = tokio::task::spawn_blocking(move || {
            let device = preferred_device(cuda_device);
            tracing::info!(device = ?device, "loading models");
            let models = ModelRegistry::load(&model, &checkpoints, &device)?;
            Pipeline::new(models, &model, &service).map(|p| (p, service))
        })
        .await
        .map_err(|join_error| Error::Manager(format!("model load task panicked: {join_error}")))?;

        let (pipeline, service) = pipeline?;
        Ok(Self::with_pipeline(pipeline, &service))
    }

    /// Wrap already-loaded model handles.
    pub fn from_models(
        models: ModelSet,
        model_config: &ModelConfig,
        service: &ServiceConfig,
    ) -> Result<Self> {
        Ok(Self::with_pipeline(
            Pipeline::new(models, model_config, service)?,
            service,
        ))
    }

    fn with_pipeline(pipeline: Pipeline, service: &ServiceConfig) -> Self {
        let slots = service.max_concurrent_requests.max(1);
        tracing::info!(max_concurrent_requests = slots, "generation manager ready");
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Run a request under a fresh random id.
    pub async fn generate(
        &self,
        upload: UploadedAudio,
        params: GenerationParameters,
    ) -> Result<GenerationOutcome> {
        self.generate_with_id(RequestId::generate(), upload, params)
            .await
    }

    /// Run a request under a caller-chosen id.
    pub async fn generate_with_id(
        &self,
        id: RequestId,
        upload: UploadedAudio,
        params: GenerationParameters,
    ) -> Result<GenerationOutcome> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;
        tracing::debug!(
            request_id = %id,
            available = self.permits.available_permits(),
            "request admitted"
        );

        let pipeline = self.pipeline.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.handle_request_with_id(id, upload, params)
        })
        .await
        .map_err(|join_error| Error::Manager(format!("generation task panicked: {join_error}")))?
    }
}
