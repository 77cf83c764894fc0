//! Audio buffers, WAV I/O, resampling and request preprocessing.
//!
//! - [`wav`] — decode uploads / write generated waveforms
//! - [`resample`] — band-limited sample-rate conversion (rubato)
//! - [`preprocess`] — the mono / 10 s / dual-rate preparation every request goes through

pub mod preprocess;
pub mod resample;
mod wav;

pub use preprocess::{PreparedAudio, Preprocessor};
pub use resample::resample;
pub use wav::{decode_wav, read_wav, write_wav};

use crate::{Error, Result};

/// Interleaved f32 samples in [-1, 1] plus their layout.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl AudioBuffer {
    /// Wrap interleaved samples. The sample count must be a whole number of frames.
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 {
            return Err(Error::AudioFormat("audio has no channels".into()));
        }
        if sample_rate == 0 {
            return Err(Error::AudioFormat("sample rate must be > 0".into()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(Error::AudioFormat(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Single-channel buffer.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(samples, 1, sample_rate)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Samples per channel.
    pub fn num_frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.num_frames() as f64 / self.sample_rate as f64
    }

    /// Average all channels into one. Mono input is returned unchanged.
    pub fn downmix(self) -> Self {
        if self.channels == 1 {
            return self;
        }
        let channels = self.channels as usize;
        let samples = self
            .samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Self {
            samples,
            channels: 1,
            sample_rate: self.sample_rate,
        }
    }

    /// Keep at most `max_frames` frames from the start.
    pub fn truncate_frames(&mut self, max_frames: usize) {
        self.samples.truncate(max_frames * self.channels as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = AudioBuffer::new(vec![1.0, 0.0, 0.5, -0.5, -1.0, 1.0], 2, 8000).unwrap();
        let mono = stereo.downmix();
        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.samples(), &[0.5, 0.0, 0.0]);
        assert_eq!(mono.sample_rate(), 8000);
    }

    #[test]
    fn test_truncate_frames_respects_channels() {
        let mut buf = AudioBuffer::new(vec![0.0; 20], 2, 10).unwrap();
        buf.truncate_frames(4);
        assert_eq!(buf.num_frames(), 4);
        assert_eq!(buf.samples().len(), 8);
    }

    #[test]
    fn test_rejects_ragged_frames() {
        assert!(matches!(
            AudioBuffer::new(vec![0.0; 5], 2, 16_000),
            Err(Error::AudioFormat(_))
        ));
        assert!(AudioBuffer::new(vec![], 0, 16_000).is_err());
    }

    #[test]
    fn test_duration() {
        let buf = AudioBuffer::mono(vec![0.0; 24_000], 48_000).unwrap();
        assert!((buf.duration_secs() - 0.5).abs() < 1e-9);
    }
}
