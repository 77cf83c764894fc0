//! Rotary position embedding tables.
//!
//! Generation calls the transformer once per sampled token with a prefix
//! that only grows, so the cos/sin tables are built once for the whole
//! context window at load time and each call takes a leading slice.

use candle_core::{D, DType, Device, Tensor};

use crate::{Error, Result};

/// Precomputed half-split rotary tables for positions `0..max_positions`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    max_positions: usize,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f64, max_positions: usize, device: &Device) -> Result<Self> {
        let half = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let angles: Vec<f32> = (0..max_positions)
            .flat_map(|pos| inv_freq.iter().map(move |f| pos as f32 * f))
            .collect();
        let angles = Tensor::from_vec(angles, (max_positions, half), device)?;
        // Both halves of the head rotate by the same angle.
        let angles = Tensor::cat(&[&angles, &angles], 1)?;
        Ok(Self {
            cos: angles.cos()?,
            sin: angles.sin()?,
            max_positions,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// `(cos, sin)` for positions `0..seq_len`, each `[seq_len, head_dim]`.
    pub fn tables(&self, seq_len: usize) -> Result<(Tensor, Tensor)> {
        if seq_len > self.max_positions {
            return Err(Error::Config(format!(
                "sequence of {seq_len} tokens exceeds the {} rotary positions",
                self.max_positions
            )));
        }
        Ok((self.cos.narrow(0, 0, seq_len)?, self.sin.narrow(0, 0, seq_len)?))
    }

    /// Rotate `x` (`[B, H, S, D]`) by tables from [`Self::tables`]. The
    /// rotation runs in f32 and the result keeps `x`'s dtype.
    pub fn apply(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let half = x.dim(D::Minus1)? / 2;
        let rotated = Tensor::cat(
            &[&x.narrow(D::Minus1, half, half)?.neg()?, &x.narrow(D::Minus1, 0, half)?],
            D::Minus1,
        )?;
        let out = (x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?;
        Ok(out.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn tables_are_leading_slices() {
        let rope = RotaryEmbedding::new(16, 10_000.0, 40, &Device::Cpu).unwrap();
        let (cos_full, sin_full) = rope.tables(40).unwrap();
        let (cos, sin) = rope.tables(7).unwrap();
        assert_eq!(cos.dims(), &[7, 16]);
        assert_eq!(sin.dims(), &[7, 16]);
        let diff = (cos_full.narrow(0, 0, 7).unwrap() - &cos).unwrap();
        assert_eq!(max_abs(&diff), 0.0);
        assert!(max_abs(&cos_full) <= 1.0 + 1e-6);
        assert!(max_abs(&sin_full) <= 1.0 + 1e-6);
    }

    #[test]
    fn longer_than_window_is_rejected() {
        let rope = RotaryEmbedding::new(8, 10_000.0, 5, &Device::Cpu).unwrap();
        assert!(rope.tables(5).is_ok());
        assert!(rope.tables(6).is_err());
    }

    #[test]
    fn position_zero_is_identity_and_rotation_keeps_norm() {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(8, 10_000.0, 16, &device).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 2, 16, 8), &device).unwrap();
        let (cos, sin) = rope.tables(16).unwrap();
        let out = RotaryEmbedding::apply(&x, &cos, &sin).unwrap();

        let first = (out.narrow(2, 0, 1).unwrap() - x.narrow(2, 0, 1).unwrap()).unwrap();
        assert!(max_abs(&first) < 1e-6);

        let norm = |t: &Tensor| -> f32 { t.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap() };
        assert!((norm(&x) - norm(&out)).abs() / norm(&x) < 1e-4);
    }
}
