//! Model hyperparameters, checkpoint layout and service settings.
//!
//! [`ModelConfig`] mirrors the JSON model documents used at training time
//! (`clap_rvq_cfg`, `hubert_kmeans_cfg`, `encodec_cfg`, ...). Training-only
//! keys such as dropout rates are accepted and ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Residual vector quantizer on top of the CLAP text embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClapRvqConfig {
    pub rq_num_quantizers: usize,
    pub codebook_size: usize,
    #[serde(default)]
    pub enable_fusion: bool,
    #[serde(default = "default_amodel_type")]
    pub amodel_type: String,
}

fn default_amodel_type() -> String {
    "HTSAT-tiny".to_string()
}

impl Default for ClapRvqConfig {
    fn default() -> Self {
        Self {
            rq_num_quantizers: 12,
            codebook_size: 1024,
            enable_fusion: false,
            amodel_type: default_amodel_type(),
        }
    }
}

/// HuBERT embedding + k-means clustering for semantic tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubertKmeansConfig {
    pub model_name: String,
    pub normalize_embeds: bool,
    #[serde(default = "default_embed_layer")]
    pub embed_layer: usize,
    #[serde(default = "default_hubert_sample_hz")]
    pub target_sample_hz: u32,
    #[serde(default = "default_seq_len_multiple_of")]
    pub seq_len_multiple_of: usize,
    #[serde(default = "default_codebook_size")]
    pub codebook_size: usize,
    #[serde(default = "default_hubert_output_hz")]
    pub output_hz: u32,
}

fn default_embed_layer() -> usize {
    7
}
fn default_hubert_sample_hz() -> u32 {
    16_000
}
fn default_seq_len_multiple_of() -> usize {
    320
}
fn default_codebook_size() -> usize {
    1024
}
fn default_hubert_output_hz() -> u32 {
    50
}

impl Default for HubertKmeansConfig {
    fn default() -> Self {
        Self {
            model_name: "m-a-p/MERT-v0".to_string(),
            normalize_embeds: true,
            embed_layer: default_embed_layer(),
            target_sample_hz: default_hubert_sample_hz(),
            seq_len_multiple_of: default_seq_len_multiple_of(),
            codebook_size: default_codebook_size(),
            output_hz: default_hubert_output_hz(),
        }
    }
}

/// EnCodec neural codec (24 kHz variant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodecConfig {
    pub bandwidth: f64,
    pub codebook_size: usize,
    #[serde(default = "default_encodec_output_hz")]
    pub output_hz: u32,
    #[serde(default = "default_encodec_sample_rate")]
    pub sample_rate: u32,
}

fn default_encodec_output_hz() -> u32 {
    75
}
fn default_encodec_sample_rate() -> u32 {
    24_000
}

impl Default for EncodecConfig {
    fn default() -> Self {
        Self {
            bandwidth: 6.0,
            codebook_size: 1024,
            output_hz: default_encodec_output_hz(),
            sample_rate: default_encodec_sample_rate(),
        }
    }
}

/// Decoder-only token transformer used by both generation stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default)]
    pub max_absolute_position_embeddings: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
}

fn default_dim() -> usize {
    1024
}
fn default_depth() -> usize {
    6
}
fn default_heads() -> usize {
    8
}
fn default_rope_theta() -> f64 {
    10_000.0
}
fn default_norm_eps() -> f64 {
    1e-5
}

impl TransformerConfig {
    /// Semantic-from-vocal transformer defaults (24 layers, 16 heads).
    pub fn semcoarsetosem() -> Self {
        Self {
            dim: 1024,
            depth: 24,
            heads: 16,
            max_absolute_position_embeddings: 12 + 300 + 900,
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
        }
    }

    /// Coarse-from-semantic transformer defaults.
    pub fn coarse() -> Self {
        Self {
            max_absolute_position_embeddings: 12 + 100 + 600,
            ..Self::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.dim / self.heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.heads == 0 || self.dim % self.heads != 0 {
            return Err(Error::Config(format!(
                "transformer dim {} is not divisible by {} heads",
                self.dim, self.heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::Config(format!(
                "rotary embeddings need an even head dim, got {}",
                self.head_dim()
            )));
        }
        Ok(())
    }
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            depth: default_depth(),
            heads: default_heads(),
            max_absolute_position_embeddings: 12 + 250,
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
        }
    }
}

/// Cross-model settings: audio windows and quantizer counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_semantic_seconds")]
    pub semantic_audio_length_seconds: f64,
    #[serde(default = "default_coarse_seconds")]
    pub coarse_audio_length_seconds: f64,
    #[serde(default = "default_fine_seconds")]
    pub fine_audio_length_seconds: f64,
    #[serde(default = "default_clap_seconds")]
    pub clap_audio_length_seconds: f64,
    #[serde(default = "default_num_coarse_quantizers")]
    pub num_coarse_quantizers: usize,
    #[serde(default = "default_num_fine_quantizers")]
    pub num_fine_quantizers: usize,
}

fn default_semantic_seconds() -> f64 {
    10.0
}
fn default_coarse_seconds() -> f64 {
    4.0
}
fn default_fine_seconds() -> f64 {
    2.0
}
fn default_clap_seconds() -> f64 {
    10.0
}
fn default_num_coarse_quantizers() -> usize {
    3
}
fn default_num_fine_quantizers() -> usize {
    5
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            semantic_audio_length_seconds: default_semantic_seconds(),
            coarse_audio_length_seconds: default_coarse_seconds(),
            fine_audio_length_seconds: default_fine_seconds(),
            clap_audio_length_seconds: default_clap_seconds(),
            num_coarse_quantizers: default_num_coarse_quantizers(),
            num_fine_quantizers: default_num_fine_quantizers(),
        }
    }
}

/// Full model configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub clap_rvq_cfg: ClapRvqConfig,
    pub hubert_kmeans_cfg: HubertKmeansConfig,
    pub encodec_cfg: EncodecConfig,
    #[serde(default)]
    pub semantic_cfg: TransformerConfig,
    #[serde(default = "TransformerConfig::coarse")]
    pub coarse_cfg: TransformerConfig,
    #[serde(default = "TransformerConfig::semcoarsetosem")]
    pub semcoarsetosem_cfg: TransformerConfig,
    #[serde(default)]
    pub global_cfg: GlobalConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            clap_rvq_cfg: ClapRvqConfig::default(),
            hubert_kmeans_cfg: HubertKmeansConfig::default(),
            encodec_cfg: EncodecConfig::default(),
            semantic_cfg: TransformerConfig::default(),
            coarse_cfg: TransformerConfig::coarse(),
            semcoarsetosem_cfg: TransformerConfig::semcoarsetosem(),
            global_cfg: GlobalConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Load a JSON model document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Take the coarse transformer and coarse quantizer count from a second
    /// document, keeping everything else from `self`.
    ///
    /// The semantic-from-vocal checkpoint ships its own document while the
    /// coarse checkpoint was trained against the base one.
    pub fn with_coarse_from(mut self, base: &ModelConfig) -> Self {
        self.coarse_cfg = base.coarse_cfg.clone();
        self.global_cfg.num_coarse_quantizers = base.global_cfg.num_coarse_quantizers;
        self
    }

    /// Resolve the model document from the optional base and
    /// semantic-from-vocal files. Missing files fall back to defaults.
    pub fn from_documents(base: Option<&Path>, semcoarsetosem: Option<&Path>) -> Result<Self> {
        let base = match base {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        match semcoarsetosem {
            Some(path) => {
                let merged = Self::load(path)?.with_coarse_from(&base);
                merged.validate()?;
                Ok(merged)
            }
            None => Ok(base),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.coarse_cfg.validate()?;
        self.semcoarsetosem_cfg.validate()?;
        if self.global_cfg.num_coarse_quantizers == 0 {
            return Err(Error::Config("num_coarse_quantizers must be > 0".into()));
        }
        if self.encodec_cfg.output_hz == 0 || self.hubert_kmeans_cfg.output_hz == 0 {
            return Err(Error::Config("token frame rates must be > 0".into()));
        }
        Ok(())
    }

    /// Semantic frames of conditioning the stages keep.
    pub fn semantic_window_frames(&self) -> usize {
        (self.global_cfg.coarse_audio_length_seconds * self.hubert_kmeans_cfg.output_hz as f64)
            as usize
    }

    /// Coarse codec frames of conditioning the stages keep.
    pub fn coarse_window_frames(&self) -> usize {
        (self.global_cfg.coarse_audio_length_seconds * self.encodec_cfg.output_hz as f64) as usize
    }
}

/// Named weight files, one set per model component.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointPaths {
    pub hubert: PathBuf,
    pub kmeans: PathBuf,
    pub encodec: PathBuf,
    pub encodec_config: PathBuf,
    pub clap_text: PathBuf,
    pub clap_text_config: PathBuf,
    pub clap_tokenizer: PathBuf,
    pub clap_rvq: PathBuf,
    pub semcoarsetosem: PathBuf,
    pub coarse: PathBuf,
}

impl CheckpointPaths {
    /// Standard file names inside a weights directory.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            hubert: dir.join("hubert_base.safetensors"),
            kmeans: dir.join("kmeans_10s_no_fusion.safetensors"),
            encodec: dir.join("encodec_24khz.safetensors"),
            encodec_config: dir.join("encodec_24khz.json"),
            clap_text: dir.join("clap_text.safetensors"),
            clap_text_config: dir.join("clap_text.json"),
            clap_tokenizer: dir.join("clap_tokenizer.json"),
            clap_rvq: dir.join("clap.rvq.950_no_fusion.safetensors"),
            semcoarsetosem: dir.join("real_semcoarsetosem.transformer.5170.safetensors"),
            coarse: dir.join("coarse.transformer.18000.safetensors"),
        }
    }
}

/// Runtime settings for request handling.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root under which each request gets its own `<request_id>/` tree.
    pub work_dir: PathBuf,
    /// Durable evaluation archive.
    pub archive_dir: PathBuf,
    /// Requests allowed to run the pipeline at the same time.
    pub max_concurrent_requests: usize,
    /// Largest accepted upload body in bytes.
    pub max_upload_bytes: usize,
    /// Run the three token extractions concurrently.
    pub parallel_extraction: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("accompanist"),
            archive_dir: default_archive_dir(),
            max_concurrent_requests: 4,
            max_upload_bytes: 64 * 1024 * 1024, // 64 MiB
            parallel_extraction: true,
        }
    }
}

/// `<data_local_dir>/accompanist/eval`, falling back to the temp dir.
pub fn default_archive_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("accompanist")
        .join("eval")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.global_cfg.num_coarse_quantizers, 3);
        assert_eq!(cfg.hubert_kmeans_cfg.target_sample_hz, 16_000);
        assert_eq!(cfg.hubert_kmeans_cfg.output_hz, 50);
        assert_eq!(cfg.encodec_cfg.output_hz, 75);
        assert_eq!(cfg.semcoarsetosem_cfg.depth, 24);
        assert_eq!(cfg.semcoarsetosem_cfg.head_dim(), 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_window_frames() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.semantic_window_frames(), 200); // 4s * 50Hz
        assert_eq!(cfg.coarse_window_frames(), 300); // 4s * 75Hz
    }

    #[test]
    fn test_parse_training_document() {
        // Training-only keys must be ignored.
        let json = r#"{
            "clap_rvq_cfg": {"rq_num_quantizers": 12, "codebook_size": 1024, "rq_ema_decay": 0.95},
            "hubert_kmeans_cfg": {"model_name": "m-a-p/MERT-v0", "normalize_embeds": true},
            "encodec_cfg": {"bandwidth": 6.0, "codebook_size": 1024},
            "semantic_cfg": {"dim": 1024, "depth": 6, "heads": 8, "ff_dropout": 0.1},
            "coarse_cfg": {"dim": 1024, "depth": 6, "heads": 8, "use_conv_ff": true},
            "global_cfg": {"num_coarse_quantizers": 3}
        }"#;
        let cfg: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.clap_rvq_cfg.rq_num_quantizers, 12);
        assert_eq!(cfg.hubert_kmeans_cfg.embed_layer, 7);
        assert_eq!(cfg.encodec_cfg.sample_rate, 24_000);
        assert_eq!(cfg.coarse_cfg.depth, 6);
        // Missing semcoarsetosem section falls back to its own defaults.
        assert_eq!(cfg.semcoarsetosem_cfg, TransformerConfig::semcoarsetosem());
    }

    #[test]
    fn test_with_coarse_from() {
        let base = ModelConfig {
            coarse_cfg: TransformerConfig {
                depth: 12,
                ..TransformerConfig::coarse()
            },
            ..ModelConfig::default()
        };
        let merged = ModelConfig::default().with_coarse_from(&base);
        assert_eq!(merged.coarse_cfg.depth, 12);
        assert_eq!(merged.semcoarsetosem_cfg.depth, 24);
    }

    #[test]
    fn test_rejects_bad_head_split() {
        let cfg = TransformerConfig {
            dim: 100,
            heads: 3,
            ..TransformerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file_is_storage_error() {
        let err = ModelConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn test_from_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut base = ModelConfig::default();
        base.coarse_cfg.depth = 12;
        let base_path = dir.path().join("base.json");
        std::fs::write(&base_path, serde_json::to_string(&base).unwrap()).unwrap();

        let mut stage1 = ModelConfig::default();
        stage1.coarse_cfg.depth = 2;
        stage1.semcoarsetosem_cfg.depth = 8;
        let stage1_path = dir.path().join("semcoarsetosem.json");
        std::fs::write(&stage1_path, serde_json::to_string(&stage1).unwrap()).unwrap();

        let merged =
            ModelConfig::from_documents(Some(&base_path), Some(&stage1_path)).unwrap();
        assert_eq!(merged.coarse_cfg.depth, 12);
        assert_eq!(merged.semcoarsetosem_cfg.depth, 8);

        assert_eq!(
            ModelConfig::from_documents(None, None).unwrap(),
            ModelConfig::default()
        );
    }

    #[test]
    fn test_checkpoint_names() {
        let paths = CheckpointPaths::in_dir("/weights");
        assert_eq!(
            paths.coarse,
            PathBuf::from("/weights/coarse.transformer.18000.safetensors")
        );
        assert_eq!(
            paths.kmeans,
            PathBuf::from("/weights/kmeans_10s_no_fusion.safetensors")
        );
    }
}
