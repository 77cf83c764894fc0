//! Band-limited sample-rate conversion.
//!
//! Uses rubato's windowed-sinc resampler over the whole clip in one chunk,
//! then drops the filter delay so sample `i` of the output lines up with
//! time `i / to_hz` of the input. Output length is `ceil(n * to / from)`.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::{Error, Result};

/// Inputs shorter than this go through linear interpolation instead.
const MIN_SINC_INPUT: usize = 256;

/// Resample a mono signal from `from_hz` to `to_hz`.
pub fn resample(samples: &[f32], from_hz: u32, to_hz: u32) -> Result<Vec<f32>> {
    if from_hz == 0 || to_hz == 0 {
        return Err(Error::AudioFormat(format!(
            "cannot resample {from_hz} Hz -> {to_hz} Hz"
        )));
    }
    if samples.is_empty() || from_hz == to_hz {
        return Ok(samples.to_vec());
    }

    let expected = resampled_len(samples.len(), from_hz, to_hz);
    if samples.len() < MIN_SINC_INPUT {
        return Ok(resample_linear(samples, from_hz, to_hz, expected));
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_hz as f64 / from_hz as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, samples.len(), 1)
        .map_err(|e| Error::AudioFormat(format!("resampler init failed: {e}")))?;
    let delay = resampler.output_delay();

    let mut out = resampler
        .process(&[samples], None)
        .map_err(|e| Error::AudioFormat(format!("resampling failed: {e}")))?
        .pop()
        .unwrap_or_default();
    // Flush the filter so the tail of the clip is not lost to the delay.
    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(|e| Error::AudioFormat(format!("resampling flush failed: {e}")))?
        .pop()
        .unwrap_or_default();
    out.extend(tail);

    let mut out: Vec<f32> = out.into_iter().skip(delay).collect();
    out.resize(expected, 0.0);
    Ok(out)
}

/// `ceil(len * to_hz / from_hz)`.
pub fn resampled_len(len: usize, from_hz: u32, to_hz: u32) -> usize {
    let num = len as u64 * to_hz as u64;
    num.div_ceil(from_hz as u64) as usize
}

fn resample_linear(samples: &[f32], from_hz: u32, to_hz: u32, out_len: usize) -> Vec<f32> {
    let step = from_hz as f64 / to_hz as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let left = (pos.floor() as usize).min(last);
            let right = (left + 1).min(last);
            let frac = (pos - left as f64) as f32;
            samples[left] * (1.0 - frac) + samples[right] * frac
        })
        .collect()
}
