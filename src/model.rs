//! Model handles consumed by the pipeline.
//!
//! The pipeline only talks to the traits in this module. Every method takes
//! `&self`: handles are loaded once and shared read-only across requests, so
//! no per-request state may live on them.
//!
//! ## Implementations
//!
//! - [`hubert`] — HuBERT encoder + k-means ([`SemanticModel`])
//! - [`encodec`] — EnCodec 24 kHz ([`AcousticCodec`])
//! - [`clap`] — CLAP text tower + residual VQ ([`TextConditioner`])
//! - [`transformer`] — decoder-only token transformer ([`TokenTransformer`])
//! - [`registry`] — loads all of the above from a weights directory

pub mod clap;
pub mod encodec;
pub mod hubert;
pub mod quantizer;
pub mod registry;
pub mod transformer;

use std::sync::Arc;

use candle_core::Device;

use crate::Result;
use crate::tokens::TokenSequence;

/// Self-supervised audio encoder followed by clustering.
pub trait SemanticModel: Send + Sync {
    /// Sample rate the encoder expects.
    fn target_sample_rate(&self) -> u32;
    /// Token frames per second of audio.
    fn output_hz(&self) -> u32;
    fn codebook_size(&self) -> usize;
    /// One token per output frame.
    fn tokenize(&self, samples: &[f32]) -> Result<TokenSequence>;
}

/// Neural codec with residual vector quantization.
pub trait AcousticCodec: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn output_hz(&self) -> u32;
    fn codebook_size(&self) -> usize;
    /// Encode and keep only the first `num_quantizers` residual levels.
    ///
    /// Also returns the residual left after those levels, flattened.
    fn encode(&self, samples: &[f32], num_quantizers: usize)
    -> Result<(TokenSequence, Vec<f32>)>;
    /// Decode whatever levels `tokens` carries back to a mono waveform.
    fn decode(&self, tokens: &TokenSequence) -> Result<Vec<f32>>;
}

/// Text branch of a joint audio-text embedding model.
pub trait TextConditioner: Send + Sync {
    fn codebook_size(&self) -> usize;
    fn num_quantizers(&self) -> usize;
    /// One frame of `num_quantizers` codes for the prompt.
    fn tokenize_text(&self, text: &str) -> Result<TokenSequence>;
}

/// Autoregressive decoder over a flat token vocabulary.
pub trait TokenTransformer: Send + Sync {
    fn vocab_size(&self) -> usize;
    /// Longest prefix (in tokens) the model accepts.
    fn max_context(&self) -> usize;
    /// Logits over the vocabulary for the position after `prefix`.
    fn next_token_logits(&self, prefix: &[u32]) -> Result<Vec<f32>>;
}

/// The five process-wide model handles.
#[derive(Clone)]
pub struct ModelSet {
    pub semantic: Arc<dyn SemanticModel>,
    pub codec: Arc<dyn AcousticCodec>,
    pub text: Arc<dyn TextConditioner>,
    pub semcoarsetosem: Arc<dyn TokenTransformer>,
    pub coarse: Arc<dyn TokenTransformer>,
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet")
            .field("semantic_rate", &self.semantic.target_sample_rate())
            .field("codec_rate", &self.codec.sample_rate())
            .field("text_quantizers", &self.text.num_quantizers())
            .field("semcoarsetosem_vocab", &self.semcoarsetosem.vocab_size())
            .field("coarse_vocab", &self.coarse.vocab_size())
            .finish()
    }
}

/// CUDA device `ordinal` when built with CUDA and one is present, else CPU.
pub fn preferred_device(ordinal: usize) -> Device {
    Device::cuda_if_available(ordinal).unwrap_or(Device::Cpu)
}
