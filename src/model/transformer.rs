//! Decoder-only token transformer shared by both generation stages.
//!
//! Pre-norm blocks of causal self-attention (RoPE) and a SiLU-gated MLP,
//! followed by a final RMSNorm and a linear head over the flat vocabulary.
//!
//! ## Weights
//!
//! ```text
//! token_emb.weight                 [vocab, dim]
//! layers.{i}.attn_norm.weight      [dim]
//! layers.{i}.attn.to_{q,k,v,out}   [dim, dim]
//! layers.{i}.ff_norm.weight        [dim]
//! layers.{i}.ff.{w1,w3}            [4*dim, dim]
//! layers.{i}.ff.w2                 [dim, 4*dim]
//! final_norm.weight                [dim]
//! to_logits.weight                 [vocab, dim]
//! ```
//!
//! Rotary tables and the causal mask are built once for the whole context
//! window; each call takes their leading slice. Beyond that the model is
//! stateless: every call recomputes the full prefix, so one loaded instance
//! can serve concurrent requests.

pub mod attention;
pub mod rope;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::Result;
use crate::config::TransformerConfig;
use crate::model::TokenTransformer;

const FF_MULT: usize = 4;

/// Context window when the checkpoint document does not set one.
const DEFAULT_MAX_CONTEXT: usize = 2048;

/// SiLU-gated feed-forward.
struct FeedForward {
    w1: candle_nn::Linear,
    w2: candle_nn::Linear,
    w3: candle_nn::Linear,
}

impl FeedForward {
    fn load(vb: VarBuilder, dim: usize) -> Result<Self> {
        let hidden = dim * FF_MULT;
        Ok(Self {
            w1: candle_nn::linear_no_bias(dim, hidden, vb.pp("w1"))?,
            w2: candle_nn::linear_no_bias(hidden, dim, vb.pp("w2"))?,
            w3: candle_nn::linear_no_bias(dim, hidden, vb.pp("w3"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w1.forward(x)?)?;
        let up = self.w3.forward(x)?;
        Ok(self.w2.forward(&(gate * up)?)?)
    }
}

struct Block {
    attn_norm: candle_nn::RmsNorm,
    attn: attention::CausalSelfAttention,
    ff_norm: candle_nn::RmsNorm,
    ff: FeedForward,
}

impl Block {
    fn load(vb: VarBuilder, config: &TransformerConfig) -> Result<Self> {
        Ok(Self {
            attn_norm: candle_nn::rms_norm(config.dim, config.norm_eps, vb.pp("attn_norm"))?,
            attn: attention::CausalSelfAttention::load(
                vb.pp("attn"),
                config.dim,
                config.heads,
                config.head_dim(),
            )?,
            ff_norm: candle_nn::rms_norm(config.dim, config.norm_eps, vb.pp("ff_norm"))?,
            ff: FeedForward::load(vb.pp("ff"), config.dim)?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let h = self
            .attn
            .forward(&self.attn_norm.forward(x)?, mask, cos, sin)?;
        let x = (x + h)?;
        let h = self.ff.forward(&self.ff_norm.forward(&x)?)?;
        Ok((x + h)?)
    }
}

/// Causal token transformer.
pub struct CausalTransformer {
    token_emb: candle_nn::Embedding,
    blocks: Vec<Block>,
    final_norm: candle_nn::RmsNorm,
    to_logits: candle_nn::Linear,
    rope: rope::RotaryEmbedding,
    mask: Tensor,
    vocab_size: usize,
    device: Device,
}

impl CausalTransformer {
    pub fn load(vb: VarBuilder, config: &TransformerConfig, vocab_size: usize) -> Result<Self> {
        config.validate()?;
        let token_emb = candle_nn::embedding(vocab_size, config.dim, vb.pp("token_emb"))?;
        let blocks = (0..config.depth)
            .map(|i| Block::load(vb.pp(format!("layers.{i}")), config))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = candle_nn::rms_norm(config.dim, config.norm_eps, vb.pp("final_norm"))?;
        let to_logits = candle_nn::linear_no_bias(config.dim, vocab_size, vb.pp("to_logits"))?;
        let max_context = match config.max_absolute_position_embeddings {
            0 => DEFAULT_MAX_CONTEXT,
            n => n,
        };
        let device = vb.device().clone();
        let rope =
            rope::RotaryEmbedding::new(config.head_dim(), config.rope_theta, max_context, &device)?;
        let mask = attention::causal_mask(max_context, &device)?;
        tracing::debug!(
            depth = config.depth,
            dim = config.dim,
            vocab_size,
            max_context,
            "loaded token transformer"
        );
        Ok(Self {
            token_emb,
            blocks,
            final_norm,
            to_logits,
            rope,
            mask,
            vocab_size,
            device,
        })
    }

    /// Logits for every position: `[1, S, vocab]`.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, seq_len) = ids.dims2()?;
        let (cos, sin) = self.rope.tables(seq_len)?;
        let mask = self.mask.narrow(0, 0, seq_len)?.narrow(1, 0, seq_len)?;
        let mut x = self.token_emb.forward(ids)?;
        for block in &self.blocks {
            x = block.forward(&x, &mask, &cos, &sin)?;
        }
        let x = self.final_norm.forward(&x)?;
        Ok(self.to_logits.forward(&x)?)
    }
}

impl TokenTransformer for CausalTransformer {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_context(&self) -> usize {
        self.rope.max_positions()
    }

    fn next_token_logits(&self, prefix: &[u32]) -> Result<Vec<f32>> {
        if prefix.is_empty() {
            return Err(crate::Error::Config(
                "token transformer needs a non-empty prefix".into(),
            ));
        }
        let ids = Tensor::from_slice(prefix, (1, prefix.len()), &self.device)?;
        let logits = self.forward(&ids)?;
        let last = logits
            .narrow(1, prefix.len() - 1, 1)?
            .squeeze(0)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;
        Ok(last.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> TransformerConfig {
        TransformerConfig {
            dim: 32,
            depth: 2,
            heads: 2,
            max_absolute_position_embeddings: 64,
            ..TransformerConfig::default()
        }
    }

    #[test]
    fn logits_cover_vocab() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalTransformer::load(vb, &tiny_config(), 50).unwrap();

        let logits = model.next_token_logits(&[1, 2, 3, 49]).unwrap();
        assert_eq!(logits.len(), 50);
        assert!(logits.iter().all(|l| l.is_finite()));
        assert_eq!(model.max_context(), 64);
    }

    #[test]
    fn same_prefix_same_logits() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalTransformer::load(vb, &tiny_config(), 20).unwrap();

        let a = model.next_token_logits(&[4, 5, 6]).unwrap();
        let b = model.next_token_logits(&[4, 5, 6]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn growing_prefix_reuses_tables() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalTransformer::load(vb, &tiny_config(), 20).unwrap();

        // Last position of a longer prefix must not change the earlier ones.
        let ids = Tensor::from_slice(&[3u32, 1, 4, 1, 5], (1, 5), &Device::Cpu).unwrap();
        let full = model.forward(&ids).unwrap();
        let short = model.forward(&ids.narrow(1, 0, 3).unwrap()).unwrap();
        let diff: f32 = (full.narrow(1, 0, 3).unwrap() - short)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "prefix logits changed by {diff}");

        let at_limit: Vec<u32> = (0..64).map(|i| i % 20).collect();
        assert!(model.next_token_logits(&at_limit).is_ok());
        let too_long: Vec<u32> = (0..65).map(|i| i % 20).collect();
        assert!(model.next_token_logits(&too_long).is_err());
    }

    #[test]
    fn unset_window_uses_default_context() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = TransformerConfig {
            max_absolute_position_embeddings: 0,
            ..tiny_config()
        };
        let model = CausalTransformer::load(vb, &config, 20).unwrap();
        assert_eq!(model.max_context(), DEFAULT_MAX_CONTEXT);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CausalTransformer::load(vb, &tiny_config(), 20).unwrap();
        assert!(model.next_token_logits(&[]).is_err());
    }
}
