//! The two autoregressive generation stages and what they share.
//!
//! Both stages drive a [`TokenTransformer`](crate::model::TokenTransformer)
//! over one flat vocabulary laid out by [`TokenLayout`]: every source (a
//! conditioning input or the generated output) owns a segment of
//! `num_quantizers * codebook_size` ids followed by a single end-of-sequence
//! id. Sampling for quantizer `q` of the output segment only ever considers
//! that quantizer's own slice, so the generated codes are always valid codec
//! or semantic codes.
//!
//! - [`semcoarsetosem`] — Stage 1, instrumental semantic tokens from the vocal
//! - [`coarse`] — Stage 2, coarse codec tokens from semantic + text, then decode
//! - [`sampling`] — top-k / temperature sampling

pub mod coarse;
pub mod sampling;
pub mod semcoarsetosem;

use std::ops::Range;

pub use coarse::{CoarseOptions, CoarseOutput, CoarseStage};
pub use sampling::Sampler;
pub use semcoarsetosem::{SemCoarseToSem, SemanticOutput};

use crate::tokens::TokenSequence;
use crate::{Error, Result};

/// Mono waveform at the codec's native rate.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedWaveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl GeneratedWaveform {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// One source's block of ids in the flat vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    offset: usize,
    num_quantizers: usize,
    codebook_size: usize,
}

impl Segment {
    pub fn num_quantizers(&self) -> usize {
        self.num_quantizers
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    /// Ids this segment occupies, EOS included.
    pub fn size(&self) -> usize {
        self.num_quantizers * self.codebook_size + 1
    }

    /// Flat ids for quantizer `q`'s codes.
    pub fn quantizer_range(&self, q: usize) -> Range<usize> {
        let start = self.offset + q * self.codebook_size;
        start..start + self.codebook_size
    }

    pub fn eos_id(&self) -> u32 {
        (self.offset + self.num_quantizers * self.codebook_size) as u32
    }

    /// Flat ids for a token sequence of this source. Source EOS codes map to
    /// the segment EOS id.
    pub fn encode(&self, tokens: &TokenSequence) -> Result<Vec<u32>> {
        if tokens.num_quantizers() != self.num_quantizers
            || tokens.codebook_size() != self.codebook_size
        {
            return Err(Error::Config(format!(
                "tokens with {}x{} codes do not fit a {}x{} segment",
                tokens.num_quantizers(),
                tokens.codebook_size(),
                self.num_quantizers,
                self.codebook_size
            )));
        }
        let eos = tokens.eos();
        Ok(tokens
            .frames()
            .flat_map(|frame| {
                frame.iter().enumerate().map(move |(q, &code)| {
                    if code == eos {
                        self.eos_id()
                    } else {
                        self.quantizer_range(q).start as u32 + code
                    }
                })
            })
            .collect())
    }
}

/// Flattened vocabulary made of consecutive segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLayout {
    segments: Vec<Segment>,
}

impl TokenLayout {
    /// Segments from `(num_quantizers, codebook_size)` pairs, in order.
    pub fn new(sources: &[(usize, usize)]) -> Self {
        let mut offset = 0;
        let segments = sources
            .iter()
            .map(|&(num_quantizers, codebook_size)| {
                let segment = Segment {
                    offset,
                    num_quantizers,
                    codebook_size,
                };
                offset += segment.size();
                segment
            })
            .collect();
        Self { segments }
    }

    pub fn segment(&self, index: usize) -> Segment {
        self.segments[index]
    }

    pub fn vocab_size(&self) -> usize {
        self.segments.iter().map(Segment::size).sum()
    }
}

/// Check a model handle against the layout it will be driven with.
pub(crate) fn check_vocab(layout: &TokenLayout, model_vocab: usize, what: &str) -> Result<()> {
    if model_vocab < layout.vocab_size() {
        return Err(Error::Config(format!(
            "{what} transformer has {model_vocab} logits, layout needs {}",
            layout.vocab_size()
        )));
    }
    Ok(())
}
