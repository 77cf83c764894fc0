//! EnCodec 24 kHz as the coarse acoustic tokenizer and waveform decoder.
//!
//! Wraps `candle_transformers::models::encodec::Model`. The codec always
//! produces every residual level its bandwidth allows; callers get only the
//! first `num_quantizers` of them, and decoding uses only the levels the
//! token sequence carries.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::encodec;

use crate::config::EncodecConfig;
use crate::model::AcousticCodec;
use crate::tokens::TokenSequence;
use crate::{Error, Result};

const HUB_REPO: &str = "facebook/encodec_24khz";

pub struct EncodecCodec {
    model: encodec::Model,
    config: EncodecConfig,
    device: Device,
}

impl EncodecCodec {
    pub fn new(model: encodec::Model, config: &EncodecConfig, device: &Device) -> Self {
        Self {
            model,
            config: config.clone(),
            device: device.clone(),
        }
    }

    /// Load from local safetensors + Hugging Face `config.json`.
    pub fn load(
        weights: &Path,
        model_config: &Path,
        config: &EncodecConfig,
        device: &Device,
    ) -> Result<Self> {
        let text =
            std::fs::read_to_string(model_config).map_err(|e| Error::storage(model_config, e))?;
        let cfg: encodec::Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", model_config.display())))?;

        tracing::info!("Loading EnCodec weights from {:?}", weights);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)
                .map_err(|e| Error::WeightLoad(format!("EnCodec weights: {e}")))?
        };
        let model = encodec::Model::new(&cfg, vb)
            .map_err(|e| Error::WeightLoad(format!("EnCodec model init: {e}")))?;
        Ok(Self::new(model, config, device))
    }

    /// Return `(weights, config)`, downloading from the hub when either
    /// local file is missing.
    pub fn resolve_files(weights: &Path, model_config: &Path) -> Result<(PathBuf, PathBuf)> {
        if weights.exists() && model_config.exists() {
            return Ok((weights.to_path_buf(), model_config.to_path_buf()));
        }
        tracing::info!(repo = HUB_REPO, "EnCodec files missing locally, fetching from hub");
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| Error::WeightLoad(format!("hub client: {e}")))?;
        let repo = api.model(HUB_REPO.to_string());
        let weights = repo
            .get("model.safetensors")
            .map_err(|e| Error::WeightLoad(format!("{HUB_REPO} weights: {e}")))?;
        let model_config = repo
            .get("config.json")
            .map_err(|e| Error::WeightLoad(format!("{HUB_REPO} config: {e}")))?;
        Ok((weights, model_config))
    }
}

impl AcousticCodec for EncodecCodec {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn output_hz(&self) -> u32 {
        self.config.output_hz
    }

    fn codebook_size(&self) -> usize {
        self.config.codebook_size
    }

    fn encode(
        &self,
        samples: &[f32],
        num_quantizers: usize,
    ) -> Result<(TokenSequence, Vec<f32>)> {
        let audio = Tensor::from_slice(samples, (1, 1, samples.len()), &self.device)?;
        let codes = self.model.encode(&audio)?; // [1, n_q, T]
        let available = codes.dim(1)?;
        if num_quantizers == 0 || num_quantizers > available {
            return Err(Error::Config(format!(
                "asked for {num_quantizers} codec levels, codec has {available}"
            )));
        }
        let coarse = codes.narrow(1, 0, num_quantizers)?;
        tracing::debug!(shape = ?coarse.dims(), "coarse codes");

        // [1, q, T] → frame-major [T, q]
        let frame_major: Vec<u32> = coarse
            .squeeze(0)?
            .t()?
            .contiguous()?
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1()?;
        let tokens = TokenSequence::new(frame_major, num_quantizers, self.config.codebook_size)?;

        // What the kept levels fail to reconstruct.
        let recon = self.model.decode(&coarse)?.flatten_all()?.to_vec1::<f32>()?;
        let residual = samples
            .iter()
            .enumerate()
            .map(|(i, &x)| x - recon.get(i).copied().unwrap_or(0.0))
            .collect();

        Ok((tokens, residual))
    }

    fn decode(&self, tokens: &TokenSequence) -> Result<Vec<f32>> {
        let tokens = tokens.strip_eos();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let (frames, q) = (tokens.num_frames(), tokens.num_quantizers());
        let codes = Tensor::from_slice(tokens.codes(), (frames, q), &self.device)?
            .t()?
            .contiguous()?
            .unsqueeze(0)?; // [1, q, T]
        let audio = self.model.decode(&codes)?; // [1, 1, N]
        Ok(audio.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_files_are_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("encodec_24khz.safetensors");
        let config = dir.path().join("encodec_24khz.json");
        std::fs::write(&weights, b"x").unwrap();
        std::fs::write(&config, b"{}").unwrap();

        let (w, c) = EncodecCodec::resolve_files(&weights, &config).unwrap();
        assert_eq!(w, weights);
        assert_eq!(c, config);
    }

    #[test]
    fn bad_model_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("encodec_24khz.json");
        std::fs::write(&config, b"not json").unwrap();
        let result = EncodecCodec::load(
            &dir.path().join("missing.safetensors"),
            &config,
            &EncodecConfig::default(),
            &Device::Cpu,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
