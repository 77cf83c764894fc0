//! Request audio preparation.
//!
//! Every upload goes through the same deterministic steps before any model
//! sees it:
//!
//! 1. downmix to mono (mean across channels)
//! 2. keep the first [`MAX_INPUT_SECONDS`] at the original sample rate
//! 3. split into a codec copy (as-is) and an extractor copy
//!    (zero-mean / unit-variance)
//! 4. resample each copy to its consumer's rate
//! 5. round-trip both through 16-bit PCM

use super::{AudioBuffer, resample};
use crate::{Error, Result};

/// Hard cap on input length. Not configurable.
pub const MAX_INPUT_SECONDS: u32 = 10;

const NORM_EPS: f32 = 1e-7;

/// The two model-ready copies of one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedAudio {
    /// Un-normalized mono signal at the codec rate.
    pub for_codec: AudioBuffer,
    /// Normalized mono signal at the semantic extractor rate.
    pub for_extractor: AudioBuffer,
}

/// Converts arbitrary uploads to the rates the codec and extractor expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    codec_rate: u32,
    extractor_rate: u32,
}

impl Preprocessor {
    pub fn new(codec_rate: u32, extractor_rate: u32) -> Self {
        Self {
            codec_rate,
            extractor_rate,
        }
    }

    pub fn codec_rate(&self) -> u32 {
        self.codec_rate
    }

    pub fn extractor_rate(&self) -> u32 {
        self.extractor_rate
    }

    pub fn prepare(&self, raw: AudioBuffer) -> Result<PreparedAudio> {
        let source_rate = raw.sample_rate();
        let mut mono = raw.downmix();
        mono.truncate_frames(MAX_INPUT_SECONDS as usize * source_rate as usize);
        if mono.is_empty() {
            return Err(Error::EmptyAudio);
        }

        let codec_signal = mono.into_samples();
        let mut extractor_signal = codec_signal.clone();
        zero_mean_unit_var_norm(&mut extractor_signal);

        let mut for_codec = resample(&codec_signal, source_rate, self.codec_rate)?;
        let mut for_extractor = resample(&extractor_signal, source_rate, self.extractor_rate)?;
        quantize_int16_roundtrip(&mut for_codec);
        quantize_int16_roundtrip(&mut for_extractor);

        tracing::debug!(
            source_rate,
            codec_samples = for_codec.len(),
            extractor_samples = for_extractor.len(),
            "preprocessed input"
        );

        Ok(PreparedAudio {
            for_codec: AudioBuffer::mono(for_codec, self.codec_rate)?,
            for_extractor: AudioBuffer::mono(for_extractor, self.extractor_rate)?,
        })
    }
}

/// Normalize in place to zero mean and unit (unbiased) variance.
pub fn zero_mean_unit_var_norm(samples: &mut [f32]) {
    let n = samples.len();
    if n == 0 {
        return;
    }
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
    let var = if n > 1 {
        samples
            .iter()
            .map(|&x| (x as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64
    } else {
        0.0
    };
    let denom = (var as f32 + NORM_EPS).sqrt();
    for x in samples.iter_mut() {
        *x = (*x - mean as f32) / denom;
    }
}

/// float -> int16 -> float. Clamps to [-1, 1], scales by 32767 and
/// truncates toward zero.
pub fn quantize_int16_roundtrip(samples: &mut [f32]) {
    for x in samples.iter_mut() {
        let pcm = (x.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        *x = pcm as f32 / i16::MAX as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, seed: u32) -> Vec<f32> {
        // Small LCG, enough to get a non-trivial waveform.
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 1.6 - 0.8
            })
            .collect()
    }

    #[test]
    fn test_stereo_long_input_becomes_mono_ten_seconds() {
        let rate = 8_000;
        let frames = rate as usize * 12;
        let raw = AudioBuffer::new(noise(frames * 2, 1), 2, rate).unwrap();
        let prepared = Preprocessor::new(24_000, 16_000).prepare(raw).unwrap();

        assert_eq!(prepared.for_codec.channels(), 1);
        assert_eq!(prepared.for_extractor.channels(), 1);
        assert_eq!(prepared.for_codec.sample_rate(), 24_000);
        assert_eq!(prepared.for_extractor.sample_rate(), 16_000);
        assert!(prepared.for_codec.duration_secs() <= 10.0);
        assert!(prepared.for_extractor.duration_secs() <= 10.0);
        assert_eq!(prepared.for_codec.num_frames(), 240_000);
    }

    #[test]
    fn test_short_input_keeps_length() {
        let raw = AudioBuffer::mono(noise(16_000, 2), 16_000).unwrap();
        let prepared = Preprocessor::new(24_000, 16_000).prepare(raw).unwrap();
        assert_eq!(prepared.for_extractor.num_frames(), 16_000);
        assert_eq!(prepared.for_codec.num_frames(), 24_000);
    }

    #[test]
    fn test_prepare_is_bit_identical_across_runs() {
        let raw = AudioBuffer::new(noise(44_100 * 2, 3), 2, 44_100).unwrap();
        let pre = Preprocessor::new(24_000, 16_000);
        let a = pre.prepare(raw.clone()).unwrap();
        let b = pre.prepare(raw).unwrap();
        let bits = |buf: &AudioBuffer| buf.samples().iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a.for_codec), bits(&b.for_codec));
        assert_eq!(bits(&a.for_extractor), bits(&b.for_extractor));
    }

    #[test]
    fn test_outputs_lie_on_int16_grid() {
        let raw = AudioBuffer::mono(noise(8_000, 4), 8_000).unwrap();
        let prepared = Preprocessor::new(24_000, 16_000).prepare(raw).unwrap();
        for &x in prepared
            .for_codec
            .samples()
            .iter()
            .chain(prepared.for_extractor.samples())
        {
            let scaled = x * 32767.0;
            assert!((scaled - scaled.round()).abs() < 1e-3);
            assert!((-1.0..=1.0).contains(&x));
        }
    }

    #[test]
    fn test_empty_input_is_rejected() {
        let raw = AudioBuffer::mono(vec![], 44_100).unwrap();
        let err = Preprocessor::new(24_000, 16_000).prepare(raw).unwrap_err();
        assert!(matches!(err, Error::EmptyAudio));
    }

    #[test]
    fn test_zero_mean_unit_var() {
        let mut x = vec![1.0, 2.0, 3.0, 4.0];
        zero_mean_unit_var_norm(&mut x);
        let mean: f32 = x.iter().sum::<f32>() / 4.0;
        let var: f32 = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 3.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_int16_roundtrip_truncates_toward_zero() {
        let mut x = vec![2.0, -2.0, 0.0, 0.5];
        quantize_int16_roundtrip(&mut x);
        assert_eq!(x[0], 1.0);
        assert_eq!(x[1], -1.0);
        assert_eq!(x[2], 0.0);
        assert_eq!(x[3], 16383.0 / 32767.0);
    }
}
