//! Causal multi-head self-attention.

use candle_core::{Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

use super::rope::RotaryEmbedding;

/// Standard scaled dot-product attention with a causal mask.
pub struct CausalSelfAttention {
    to_q: candle_nn::Linear,
    to_k: candle_nn::Linear,
    to_v: candle_nn::Linear,
    to_out: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    pub fn load(vb: VarBuilder, dim: usize, num_heads: usize, head_dim: usize) -> Result<Self> {
        let inner_dim = num_heads * head_dim;
        let to_q = candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_q"))?;
        let to_k = candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_k"))?;
        let to_v = candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_v"))?;
        let to_out = candle_nn::linear_no_bias(inner_dim, dim, vb.pp("to_out"))?;
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            num_heads,
            head_dim,
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, S, dim]`
    /// - `mask`: additive `[S, S]` bias, `-inf` above the diagonal
    /// - `rope_cos`, `rope_sin`: `[S, head_dim]`
    ///
    /// Returns `[B, S, dim]`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mask: &Tensor,
        rope_cos: &Tensor,
        rope_sin: &Tensor,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = hidden_states.dims3()?;

        let q = self.to_q.forward(hidden_states)?;
        let k = self.to_k.forward(hidden_states)?;
        let v = self.to_v.forward(hidden_states)?;

        // Reshape to [B, H, S, D]
        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = RotaryEmbedding::apply(&q, rope_cos, rope_sin)?;
        let k = RotaryEmbedding::apply(&k, rope_cos, rope_sin)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        let mask = mask.to_dtype(attn_weights.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let out = attn_weights.matmul(&v)?; // [B, H, S, D]

        let out = out
            .transpose(1, 2)? // [B, S, H, D]
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        self.to_out.forward(&out).map_err(Into::into)
    }
}

/// Additive causal mask `[S, S]`: 0 on and below the diagonal, `-inf` above.
/// Its leading `[s, s]` corner is the mask for any shorter sequence.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn causal_attention_output_shape() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);

        let attn = CausalSelfAttention::load(vb, 64, 4, 16).unwrap();

        let x = Tensor::randn(0.0_f32, 1.0, (1, 12, 64), &device).unwrap();
        let rope = RotaryEmbedding::new(16, 10_000.0, 12, &device).unwrap();
        let (cos, sin) = rope.tables(12).unwrap();
        let mask = causal_mask(12, &device).unwrap();

        let out = attn.forward(&x, &mask, &cos, &sin).unwrap();
        assert_eq!(out.dims(), &[1, 12, 64]);
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let attn = CausalSelfAttention::load(vb, 32, 2, 16).unwrap();
        let rope = RotaryEmbedding::new(16, 10_000.0, 6, &device).unwrap();
        let mask = causal_mask(6, &device).unwrap();

        let x = Tensor::randn(0.0_f32, 1.0, (1, 6, 32), &device).unwrap();
        let (cos, sin) = rope.tables(6).unwrap();
        let full = attn.forward(&x, &mask, &cos, &sin).unwrap();

        // Shorter prefix with the leading corner of the same mask.
        let prefix = x.narrow(1, 0, 4).unwrap();
        let (cos4, sin4) = rope.tables(4).unwrap();
        let mask4 = mask.narrow(0, 0, 4).unwrap().narrow(1, 0, 4).unwrap();
        let short = attn.forward(&prefix, &mask4, &cos4, &sin4).unwrap();

        let diff: f32 = (full.narrow(1, 0, 4).unwrap() - short)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "prefix outputs changed by {diff}");
    }

    #[test]
    fn mask_is_upper_triangular() {
        let mask: Vec<Vec<f32>> = causal_mask(3, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(mask[0][0], 0.0);
        assert!(mask[0][1].is_infinite());
        assert_eq!(mask[2][1], 0.0);
    }
}
