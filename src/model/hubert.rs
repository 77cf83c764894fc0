//! HuBERT encoder + k-means: semantic tokens from raw audio.
//!
//! ```text
//! audio [N] @ 16 kHz
//!   → 7 strided convs (total stride 320)      [512, T]
//!   → LayerNorm + Linear(512 → 768)           [T, 768]
//!   → + grouped positional conv, LayerNorm
//!   → first `embed_layer` post-norm encoder layers
//!   → (optional) per-frame zero-mean / unit-var
//!   → nearest k-means centroid                 [T] token ids
//! ```
//!
//! Weight names follow the Hugging Face `HubertModel` layout.

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use crate::config::HubertKmeansConfig;
use crate::model::SemanticModel;
use crate::model::quantizer::KMeans;
use crate::tokens::TokenSequence;
use crate::{Error, Result};

/// Architecture constants.
#[derive(Debug, Clone)]
pub struct HubertConfig {
    pub conv_dim: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,
    pub layer_norm_eps: f64,
}

impl HubertConfig {
    /// `hubert-base-ls960`.
    pub fn base() -> Self {
        Self {
            conv_dim: vec![512; 7],
            conv_kernel: vec![10, 3, 3, 3, 3, 2, 2],
            conv_stride: vec![5, 2, 2, 2, 2, 2, 2],
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            num_conv_pos_embeddings: 128,
            num_conv_pos_embedding_groups: 16,
            layer_norm_eps: 1e-5,
        }
    }

    /// Output frames for `num_samples` input samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .fold(num_samples, |len, (&k, &s)| {
                if len < k { 0 } else { (len - k) / s + 1 }
            })
    }
}

struct FeatureExtractor {
    convs: Vec<Conv1d>,
    group_norm: candle_nn::GroupNorm,
}

impl FeatureExtractor {
    fn load(vb: VarBuilder, cfg: &HubertConfig) -> Result<Self> {
        let mut convs = Vec::with_capacity(cfg.conv_dim.len());
        let mut in_dim = 1;
        for (i, &out_dim) in cfg.conv_dim.iter().enumerate() {
            let conv_cfg = Conv1dConfig {
                stride: cfg.conv_stride[i],
                ..Default::default()
            };
            convs.push(candle_nn::conv1d_no_bias(
                in_dim,
                out_dim,
                cfg.conv_kernel[i],
                conv_cfg,
                vb.pp(format!("conv_layers.{i}.conv")),
            )?);
            in_dim = out_dim;
        }
        let group_norm = candle_nn::group_norm(
            cfg.conv_dim[0],
            cfg.conv_dim[0],
            1e-5,
            vb.pp("conv_layers.0.layer_norm"),
        )?;
        Ok(Self { convs, group_norm })
    }

    /// `[B, N]` samples → `[B, C, T]` features.
    fn forward(&self, samples: &Tensor) -> Result<Tensor> {
        let mut x = samples.unsqueeze(1)?;
        for (i, conv) in self.convs.iter().enumerate() {
            x = conv.forward(&x)?;
            if i == 0 {
                x = self.group_norm.forward(&x)?;
            }
            x = x.gelu_erf()?;
        }
        Ok(x)
    }
}

/// Grouped conv over time, weight-normalized along the kernel axis.
struct PositionalConv {
    conv: Conv1d,
    kernel: usize,
}

impl PositionalConv {
    fn load(vb: VarBuilder, cfg: &HubertConfig) -> Result<Self> {
        let groups = cfg.num_conv_pos_embedding_groups;
        let kernel = cfg.num_conv_pos_embeddings;
        let dim = cfg.hidden_size;
        let weight_g = vb.get((1, 1, kernel), "weight_g")?;
        let weight_v = vb.get((dim, dim / groups, kernel), "weight_v")?;
        let bias = vb.get(dim, "bias")?;
        let norm = weight_v
            .sqr()?
            .sum_keepdim(0)?
            .sum_keepdim(1)?
            .sqrt()?;
        let weight = weight_v.broadcast_mul(&weight_g.broadcast_div(&norm)?)?;
        let conv_cfg = Conv1dConfig {
            padding: kernel / 2,
            groups,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv1d::new(weight, Some(bias), conv_cfg),
            kernel,
        })
    }

    /// `[B, T, C]` → `[B, T, C]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let h = self.conv.forward(&x.transpose(1, 2)?.contiguous()?)?;
        // Even kernels produce one extra frame.
        let h = if self.kernel % 2 == 0 {
            h.narrow(2, 0, seq_len)?
        } else {
            h
        };
        Ok(h.gelu_erf()?.transpose(1, 2)?)
    }
}

struct SelfAttention {
    q_proj: candle_nn::Linear,
    k_proj: candle_nn::Linear,
    v_proj: candle_nn::Linear,
    out_proj: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, cfg: &HubertConfig) -> Result<Self> {
        let dim = cfg.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            num_heads: cfg.num_heads,
            head_dim: dim / cfg.num_heads,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q_proj.forward(x)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    layer_norm: candle_nn::LayerNorm,
    intermediate: candle_nn::Linear,
    output: candle_nn::Linear,
    final_layer_norm: candle_nn::LayerNorm,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, cfg: &HubertConfig) -> Result<Self> {
        let dim = cfg.hidden_size;
        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention"), cfg)?,
            layer_norm: candle_nn::layer_norm(dim, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            intermediate: candle_nn::linear(
                dim,
                cfg.intermediate_size,
                vb.pp("feed_forward.intermediate_dense"),
            )?,
            output: candle_nn::linear(
                cfg.intermediate_size,
                dim,
                vb.pp("feed_forward.output_dense"),
            )?,
            final_layer_norm: candle_nn::layer_norm(
                dim,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
        })
    }

    /// Post-norm: `norm(x + attn(x))`, then `norm(x + ff(x))`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.layer_norm.forward(&(x + self.attention.forward(x)?)?)?;
        let ff = self
            .output
            .forward(&self.intermediate.forward(&x)?.gelu_erf()?)?;
        Ok(self.final_layer_norm.forward(&(x + ff)?)?)
    }
}

/// HuBERT truncated at `embed_layer`, plus the k-means codebook.
pub struct HubertKmeans {
    feature_extractor: FeatureExtractor,
    projection_norm: candle_nn::LayerNorm,
    projection: candle_nn::Linear,
    pos_conv: PositionalConv,
    encoder_norm: candle_nn::LayerNorm,
    layers: Vec<EncoderLayer>,
    kmeans: KMeans,
    arch: HubertConfig,
    config: HubertKmeansConfig,
    device: Device,
}

impl HubertKmeans {
    /// `vb` holds the HuBERT weights, `kmeans_vb` the cluster centers.
    pub fn load(
        vb: VarBuilder,
        kmeans_vb: VarBuilder,
        arch: HubertConfig,
        config: &HubertKmeansConfig,
    ) -> Result<Self> {
        if config.embed_layer > arch.num_layers {
            return Err(Error::Config(format!(
                "embed_layer {} exceeds {} encoder layers",
                config.embed_layer, arch.num_layers
            )));
        }
        let conv_out = *arch
            .conv_dim
            .last()
            .ok_or_else(|| Error::Config("hubert needs at least one conv layer".into()))?;
        let feature_extractor = FeatureExtractor::load(vb.pp("feature_extractor"), &arch)?;
        let projection_norm = candle_nn::layer_norm(
            conv_out,
            arch.layer_norm_eps,
            vb.pp("feature_projection.layer_norm"),
        )?;
        let projection = candle_nn::linear(
            conv_out,
            arch.hidden_size,
            vb.pp("feature_projection.projection"),
        )?;
        let pos_conv = PositionalConv::load(vb.pp("encoder.pos_conv_embed.conv"), &arch)?;
        let encoder_norm = candle_nn::layer_norm(
            arch.hidden_size,
            arch.layer_norm_eps,
            vb.pp("encoder.layer_norm"),
        )?;
        // Layers past `embed_layer` never contribute to the tokens.
        let layers = (0..config.embed_layer)
            .map(|i| EncoderLayer::load(vb.pp(format!("encoder.layers.{i}")), &arch))
            .collect::<Result<Vec<_>>>()?;
        let kmeans = KMeans::load(kmeans_vb, config.codebook_size, arch.hidden_size)?;

        Ok(Self {
            feature_extractor,
            projection_norm,
            projection,
            pos_conv,
            encoder_norm,
            layers,
            kmeans,
            arch,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    /// Frame embeddings `[T, hidden]` for a mono signal.
    pub fn embed(&self, samples: &[f32]) -> Result<Tensor> {
        let multiple = self.config.seq_len_multiple_of.max(1);
        let usable = samples.len() / multiple * multiple;
        if self.arch.num_frames(usable) == 0 {
            return Err(Error::AudioFormat(format!(
                "{} samples is too short for the semantic encoder",
                samples.len()
            )));
        }
        let audio = Tensor::from_slice(&samples[..usable], (1, usable), &self.device)?;

        let features = self.feature_extractor.forward(&audio)?.transpose(1, 2)?;
        let x = self
            .projection
            .forward(&self.projection_norm.forward(&features)?)?;
        let x = (&x + self.pos_conv.forward(&x)?)?;
        let mut x = self.encoder_norm.forward(&x)?;
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        let x = x.squeeze(0)?.to_dtype(DType::F32)?;

        if self.config.normalize_embeds {
            let mean = x.mean_keepdim(D::Minus1)?;
            let centered = x.broadcast_sub(&mean)?;
            let n = x.dim(D::Minus1)?.max(2) as f64;
            let var = (centered.sqr()?.sum_keepdim(D::Minus1)? / (n - 1.0))?;
            Ok(centered.broadcast_div(&(var + 1e-7)?.sqrt()?)?)
        } else {
            Ok(x)
        }
    }
}

impl SemanticModel for HubertKmeans {
    fn target_sample_rate(&self) -> u32 {
        self.config.target_sample_hz
    }

    fn output_hz(&self) -> u32 {
        self.config.output_hz
    }

    fn codebook_size(&self) -> usize {
        self.config.codebook_size
    }

    fn tokenize(&self, samples: &[f32]) -> Result<TokenSequence> {
        let embeds = self.embed(samples)?;
        tracing::debug!(shape = ?embeds.dims(), "semantic embeddings");
        let ids = self.kmeans.assign(&embeds)?;
        TokenSequence::single(ids, self.config.codebook_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarMap};

    fn tiny_arch() -> HubertConfig {
        HubertConfig {
            conv_dim: vec![8, 8],
            conv_kernel: vec![10, 3],
            conv_stride: vec![5, 2],
            hidden_size: 16,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 32,
            num_conv_pos_embeddings: 4,
            num_conv_pos_embedding_groups: 2,
            layer_norm_eps: 1e-5,
        }
    }

    fn tiny_config() -> HubertKmeansConfig {
        HubertKmeansConfig {
            embed_layer: 1,
            seq_len_multiple_of: 10,
            codebook_size: 4,
            output_hz: 50,
            ..HubertKmeansConfig::default()
        }
    }

    fn load_tiny() -> HubertKmeans {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // The weight-normalized positional conv needs non-zero g and v.
        let prefix = "encoder.pos_conv_embed.conv";
        varmap
            .get((1, 1, 4), &format!("{prefix}.weight_g"), Init::Const(1.0), DType::F32, &device)
            .unwrap();
        let randn = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        varmap
            .get((16, 8, 4), &format!("{prefix}.weight_v"), randn, DType::F32, &device)
            .unwrap();
        let km_map = VarMap::new();
        let km_vb = VarBuilder::from_varmap(&km_map, DType::F32, &device);
        HubertKmeans::load(vb, km_vb, tiny_arch(), &tiny_config()).unwrap()
    }

    #[test]
    fn base_frame_count_is_50hz() {
        let cfg = HubertConfig::base();
        // One second at 16 kHz gives 49 frames with the standard receptive field.
        assert_eq!(cfg.num_frames(16_000), 49);
        assert_eq!(cfg.num_frames(100), 0);
    }

    #[test]
    fn tokenize_gives_one_id_per_frame() {
        let model = load_tiny();
        let samples: Vec<f32> = (0..205).map(|i| (i as f32 * 0.1).sin()).collect();
        let tokens = model.tokenize(&samples).unwrap();
        // 205 → curtailed to 200 → conv 39 → conv 19 frames.
        assert_eq!(tokens.num_frames(), 19);
        assert!(tokens.codes().iter().all(|&c| c < 4));
    }

    #[test]
    fn too_short_input_is_rejected() {
        let model = load_tiny();
        assert!(model.tokenize(&[0.0; 9]).is_err());
    }

    #[test]
    fn embed_layer_beyond_depth_is_config_error() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = HubertKmeansConfig {
            embed_layer: 5,
            ..tiny_config()
        };
        let result = HubertKmeans::load(vb.clone(), vb, tiny_arch(), &config);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
