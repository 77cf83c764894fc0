//! WAV decoding for uploads and encoding for generated audio.

use std::io::Cursor;
use std::path::Path;

use super::AudioBuffer;
use crate::{Error, Result};

/// Decode an in-memory WAV file.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    read_samples(reader)
}

/// Read a WAV file from disk. A file that cannot be opened is a storage
/// error; one that opens but does not parse is an audio format error.
pub fn read_wav(path: impl AsRef<Path>) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = hound::WavReader::open(path).map_err(|e| match e {
        hound::Error::IoError(io) => Error::storage(path, io),
        other => other.into(),
    })?;
    read_samples(reader)
}

fn read_samples<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<AudioBuffer> {
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    AudioBuffer::new(samples, spec.channels, spec.sample_rate)
}

/// Write interleaved f32 samples as a 32-bit float WAV file.
pub fn write_wav(
    path: impl AsRef<Path>,
    samples: &[f32],
    sample_rate: u32,
    num_channels: u16,
) -> Result<()> {
    let path = path.as_ref();
    let spec = hound::WavSpec {
        channels: num_channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let write = || -> std::result::Result<(), hound::Error> {
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()
    };
    write().map_err(|e| match e {
        hound::Error::IoError(io) => Error::storage(path, io),
        other => Error::AudioFormat(other.to_string()),
    })
}
