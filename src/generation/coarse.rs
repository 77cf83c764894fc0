//! Stage 2: coarse codec tokens from the generated semantic tokens and the
//! text conditioning, then waveform reconstruction.
//!
//! Prefix fed to the transformer:
//!
//! ```text
//! [clap codes…] [semantic…] (EOS) [generated coarse, frame-major…]
//! ```
//!
//! Each time step is one codec frame, i.e. `num_quantizers` sampled tokens.

use std::sync::Arc;

use crate::error::Stage;
use crate::model::{AcousticCodec, TokenTransformer};
use crate::tokens::TokenSequence;
use crate::{Error, Result};

use super::{GeneratedWaveform, Sampler, TokenLayout, check_vocab};

const TEXT_COND: usize = 0;
const SEMANTIC_COND: usize = 1;
const OUTPUT: usize = 2;

/// Knobs for one Stage 2 run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoarseOptions {
    /// Codec frames to generate.
    pub max_time_steps: usize,
    /// Append an end-marker frame to the returned tokens.
    pub include_eos_in_output: bool,
    /// Close the semantic conditioning with its end marker.
    pub append_eos_to_conditioning_tokens: bool,
    /// Decode the generated tokens to audio.
    pub reconstruct_wave: bool,
}

impl CoarseOptions {
    /// How the request pipeline drives Stage 2.
    pub fn for_request(max_time_steps: usize) -> Self {
        Self {
            max_time_steps,
            include_eos_in_output: false,
            append_eos_to_conditioning_tokens: true,
            reconstruct_wave: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseOutput {
    pub tokens: TokenSequence,
    pub waveform: Option<GeneratedWaveform>,
    /// Codec frames generated.
    pub steps_run: usize,
}

pub struct CoarseStage {
    model: Arc<dyn TokenTransformer>,
    codec: Arc<dyn AcousticCodec>,
    layout: TokenLayout,
    semantic_window: usize,
}

impl CoarseStage {
    pub fn new(
        model: Arc<dyn TokenTransformer>,
        codec: Arc<dyn AcousticCodec>,
        text_quantizers: usize,
        text_codebook: usize,
        semantic_codebook: usize,
        coarse_quantizers: usize,
        semantic_window: usize,
    ) -> Result<Self> {
        let layout = Self::layout(
            text_quantizers,
            text_codebook,
            semantic_codebook,
            coarse_quantizers,
            codec.codebook_size(),
        );
        check_vocab(&layout, model.vocab_size(), "coarse")?;
        Ok(Self {
            model,
            codec,
            layout,
            semantic_window,
        })
    }

    pub fn layout(
        text_quantizers: usize,
        text_codebook: usize,
        semantic_codebook: usize,
        coarse_quantizers: usize,
        coarse_codebook: usize,
    ) -> TokenLayout {
        TokenLayout::new(&[
            (text_quantizers, text_codebook),
            (1, semantic_codebook),
            (coarse_quantizers, coarse_codebook),
        ])
    }

    pub fn num_quantizers(&self) -> usize {
        self.layout.segment(OUTPUT).num_quantizers()
    }

    pub fn generate(
        &self,
        text: &TokenSequence,
        semantic: &TokenSequence,
        options: CoarseOptions,
        sampler: &mut Sampler,
    ) -> Result<CoarseOutput> {
        let tag = |e: Error| match e {
            e @ Error::ModelInference { .. } => e,
            other => Error::inference(Stage::CoarseGeneration, other),
        };

        let text_seg = self.layout.segment(TEXT_COND);
        let semantic_seg = self.layout.segment(SEMANTIC_COND);
        let output_seg = self.layout.segment(OUTPUT);
        let q = output_seg.num_quantizers();

        let mut prefix = text_seg.encode(&text.strip_eos()).map_err(tag)?;
        prefix.extend(
            semantic_seg
                .encode(&semantic.strip_eos().leading_frames(self.semantic_window))
                .map_err(tag)?,
        );
        if options.append_eos_to_conditioning_tokens {
            prefix.push(semantic_seg.eos_id());
        }

        let budget = options.max_time_steps * q;
        if prefix.len() + budget > self.model.max_context() {
            return Err(Error::ParameterValidation(format!(
                "{} coarse frames exceed the model context of {}",
                options.max_time_steps,
                self.model.max_context()
            )));
        }
        tracing::debug!(
            prefix_len = prefix.len(),
            frames = options.max_time_steps,
            quantizers = q,
            "coarse generation"
        );

        let mut codes = Vec::with_capacity(budget);
        for _ in 0..options.max_time_steps {
            for level in 0..q {
                let allowed = output_seg.quantizer_range(level);
                let base = allowed.start;
                let logits = self.model.next_token_logits(&prefix).map_err(tag)?;
                let id = sampler.sample(&logits, allowed).map_err(tag)?;
                prefix.push(id as u32);
                codes.push((id - base) as u32);
            }
        }
        let steps_run = codes.len() / q;
        let generated =
            TokenSequence::new(codes, q, output_seg.codebook_size()).map_err(tag)?;

        let waveform = if options.reconstruct_wave {
            // Only real code frames reach the codec.
            let samples = self
                .codec
                .decode(&generated.strip_eos())
                .map_err(|e| match e {
                    e @ Error::ModelInference { .. } => e,
                    other => Error::inference(Stage::WaveformReconstruction, other),
                })?;
            Some(GeneratedWaveform {
                samples,
                sample_rate: self.codec.sample_rate(),
            })
        } else {
            None
        };

        let tokens = if options.include_eos_in_output {
            generated.with_eos_frame()
        } else {
            generated.strip_eos()
        };

        Ok(CoarseOutput {
            tokens,
            waveform,
            steps_run,
        })
    }
}
