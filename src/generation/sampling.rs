//! Top-k filtered temperature sampling.

use std::ops::Range;

use candle_core::{Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

/// Fraction of candidates dropped before sampling (keep the top 10%).
pub const DEFAULT_FILTER_THRESHOLD: f64 = 0.9;

/// Per-request sampler. Owns its RNG so concurrent requests never share one.
pub struct Sampler {
    rng: ChaCha8Rng,
    temperature: f64,
    filter_threshold: f64,
}

impl Sampler {
    /// `seed = None` draws a fresh seed.
    pub fn new(temperature: f64, seed: Option<u64>) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(Error::ParameterValidation(format!(
                "temperature must be > 0, got {temperature}"
            )));
        }
        let seed = seed.unwrap_or_else(rand::random);
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            temperature,
            filter_threshold: DEFAULT_FILTER_THRESHOLD,
        })
    }

    pub fn with_filter_threshold(mut self, threshold: f64) -> Self {
        self.filter_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Draw one index from `logits[allowed]`. Returns an index into `logits`.
    pub fn sample(&mut self, logits: &[f32], allowed: Range<usize>) -> Result<usize> {
        let candidates = logits.get(allowed.clone()).ok_or_else(|| {
            Error::Config(format!(
                "sampling range {allowed:?} outside {} logits",
                logits.len()
            ))
        })?;
        if candidates.is_empty() {
            return Err(Error::Config("empty sampling range".into()));
        }
        if candidates.iter().any(|l| l.is_nan()) {
            return Err(Error::Config("model produced NaN logits".into()));
        }

        let keep = ((1.0 - self.filter_threshold) * candidates.len() as f64)
            .ceil()
            .max(1.0) as usize;
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let cutoff = sorted[keep.min(sorted.len()) - 1];

        let scaled: Vec<f32> = candidates
            .iter()
            .map(|&l| {
                if l >= cutoff {
                    (l as f64 / self.temperature) as f32
                } else {
                    f32::NEG_INFINITY
                }
            })
            .collect();
        let scaled = Tensor::from_vec(scaled, candidates.len(), &Device::Cpu)?;
        let probs: Vec<f32> = candle_nn::ops::softmax_last_dim(&scaled)?.to_vec1()?;

        Ok(allowed.start + sample_multinomial(&probs, &mut self.rng))
    }
}

/// Walk the CDF of `probs` with one uniform draw.
fn sample_multinomial(probs: &[f32], rng: &mut ChaCha8Rng) -> usize {
    let sample: f64 = rng.random();
    let mut cumulative = 0.0f64;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p as f64;
        if sample < cumulative {
            return i;
        }
    }
    // Floating-point rounding: take the last candidate with mass.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len().saturating_sub(1))
}
