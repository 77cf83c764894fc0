//! One-time model loading.
//!
//! Builds the five handles from a [`ModelConfig`] and a weights directory.
//! Transformer vocabularies are sized from the same token layouts the
//! generation stages use, so a mismatched checkpoint fails here rather than
//! mid-request.

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::config::{CheckpointPaths, ModelConfig};
use crate::generation::{CoarseStage, SemCoarseToSem};
use crate::model::clap::ClapText;
use crate::model::encodec::EncodecCodec;
use crate::model::hubert::{HubertConfig, HubertKmeans};
use crate::model::transformer::CausalTransformer;
use crate::model::ModelSet;
use crate::{Error, Result};

pub struct ModelRegistry;

fn mmap(path: &Path, dtype: DType, device: &Device, what: &str) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        return Err(Error::WeightLoad(format!(
            "{what} checkpoint not found: {}",
            path.display()
        )));
    }
    tracing::info!("Loading {} weights from {:?}", what, path);
    // SAFETY: checkpoint files are not modified while the process runs.
    unsafe {
        VarBuilder::from_mmaped_safetensors(&[path], dtype, device)
            .map_err(|e| Error::WeightLoad(format!("{what} weights: {e}")))
    }
}

impl ModelRegistry {
    /// Load every model handle. Blocking; call from a blocking context.
    pub fn load(
        config: &ModelConfig,
        checkpoints: &CheckpointPaths,
        device: &Device,
    ) -> Result<ModelSet> {
        config.validate()?;
        let start = std::time::Instant::now();

        let hubert_vb = mmap(&checkpoints.hubert, DType::F32, device, "HuBERT")?;
        let kmeans_vb = mmap(&checkpoints.kmeans, DType::F32, device, "k-means")?;
        let semantic = HubertKmeans::load(
            hubert_vb,
            kmeans_vb,
            HubertConfig::base(),
            &config.hubert_kmeans_cfg,
        )?;

        let (encodec_weights, encodec_config) =
            EncodecCodec::resolve_files(&checkpoints.encodec, &checkpoints.encodec_config)?;
        let codec = EncodecCodec::load(
            &encodec_weights,
            &encodec_config,
            &config.encodec_cfg,
            device,
        )?;

        let text = ClapText::load(
            &checkpoints.clap_text,
            &checkpoints.clap_text_config,
            &checkpoints.clap_tokenizer,
            &checkpoints.clap_rvq,
            &config.clap_rvq_cfg,
            device,
        )?;

        let semantic_codebook = config.hubert_kmeans_cfg.codebook_size;
        let coarse_codebook = config.encodec_cfg.codebook_size;
        let coarse_quantizers = config.global_cfg.num_coarse_quantizers;

        let stage1_vocab =
            SemCoarseToSem::layout(semantic_codebook, coarse_quantizers, coarse_codebook)
                .vocab_size();
        let semcoarsetosem = CausalTransformer::load(
            mmap(&checkpoints.semcoarsetosem, DType::F32, device, "semantic-from-vocal")?,
            &config.semcoarsetosem_cfg,
            stage1_vocab,
        )?;

        let stage2_vocab = CoarseStage::layout(
            config.clap_rvq_cfg.rq_num_quantizers,
            config.clap_rvq_cfg.codebook_size,
            semantic_codebook,
            coarse_quantizers,
            coarse_codebook,
        )
        .vocab_size();
        let coarse = CausalTransformer::load(
            mmap(&checkpoints.coarse, DType::F32, device, "coarse")?,
            &config.coarse_cfg,
            stage2_vocab,
        )?;

        tracing::info!(
            elapsed_s = start.elapsed().as_secs_f64(),
            device = ?device,
            "models loaded"
        );
        Ok(ModelSet {
            semantic: Arc::new(semantic),
            codec: Arc::new(codec),
            text: Arc::new(text),
            semcoarsetosem: Arc::new(semcoarsetosem),
            coarse: Arc::new(coarse),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_checkpoint_is_weight_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ModelRegistry::load(
            &ModelConfig::default(),
            &CheckpointPaths::in_dir(dir.path()),
            &Device::Cpu,
        );
        match result {
            Err(Error::WeightLoad(message)) => assert!(message.contains("HuBERT")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loaded models from an empty directory"),
        }
    }
}
