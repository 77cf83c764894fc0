//! Discrete token sequences produced by the extractors and generation stages.

use crate::{Error, Result};

/// Frame-major token codes: `codes[frame * num_quantizers + q]`.
///
/// Semantic tokens have one quantizer per frame; codec tokens carry one
/// code per residual level. `codebook_size` bounds every real code, and the
/// value `codebook_size` itself is reserved as the end-of-sequence marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    codes: Vec<u32>,
    num_quantizers: usize,
    codebook_size: usize,
}

impl TokenSequence {
    pub fn new(codes: Vec<u32>, num_quantizers: usize, codebook_size: usize) -> Result<Self> {
        if num_quantizers == 0 || codebook_size == 0 {
            return Err(Error::Config(
                "token sequences need at least one quantizer and code".into(),
            ));
        }
        if codes.len() % num_quantizers != 0 {
            return Err(Error::Config(format!(
                "{} codes do not split into frames of {num_quantizers}",
                codes.len()
            )));
        }
        if let Some(&bad) = codes.iter().find(|&&c| c as usize > codebook_size) {
            return Err(Error::Config(format!(
                "code {bad} exceeds codebook size {codebook_size}"
            )));
        }
        Ok(Self {
            codes,
            num_quantizers,
            codebook_size,
        })
    }

    /// Single-quantizer sequence.
    pub fn single(codes: Vec<u32>, codebook_size: usize) -> Result<Self> {
        Self::new(codes, 1, codebook_size)
    }

    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    pub fn num_quantizers(&self) -> usize {
        self.num_quantizers
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    /// End-of-sequence marker for this source.
    pub fn eos(&self) -> u32 {
        self.codebook_size as u32
    }

    pub fn num_frames(&self) -> usize {
        self.codes.len() / self.num_quantizers
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &[u32]> {
        self.codes.chunks_exact(self.num_quantizers)
    }

    /// First `max_frames` frames.
    pub fn leading_frames(&self, max_frames: usize) -> Self {
        let keep = max_frames.min(self.num_frames()) * self.num_quantizers;
        Self {
            codes: self.codes[..keep].to_vec(),
            ..self.clone_empty()
        }
    }

    /// Drop everything from the first frame that contains an end marker.
    pub fn strip_eos(&self) -> Self {
        let eos = self.eos();
        let keep = self
            .frames()
            .position(|frame| frame.contains(&eos))
            .unwrap_or(self.num_frames());
        self.leading_frames(keep)
    }

    /// Append one all-EOS frame.
    pub fn with_eos_frame(&self) -> Self {
        let mut codes = self.codes.clone();
        codes.extend(std::iter::repeat_n(self.eos(), self.num_quantizers));
        Self {
            codes,
            ..self.clone_empty()
        }
    }

    pub fn contains_eos(&self) -> bool {
        self.codes.contains(&self.eos())
    }

    fn clone_empty(&self) -> Self {
        Self {
            codes: Vec::new(),
            num_quantizers: self.num_quantizers,
            codebook_size: self.codebook_size,
        }
    }
}
