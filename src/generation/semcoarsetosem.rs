//! Stage 1: instrumental semantic tokens from the vocal's semantic and
//! coarse tokens.
//!
//! Prefix fed to the transformer:
//!
//! ```text
//! [vocal semantic…] EOS [vocal coarse, frame-major…] EOS [generated semantic…]
//! ```
//!
//! The output is never decoded to audio; it only conditions Stage 2.

use std::sync::Arc;

use crate::error::Stage;
use crate::model::TokenTransformer;
use crate::tokens::TokenSequence;
use crate::{Error, Result};

use super::{Sampler, TokenLayout, check_vocab};

const SEMANTIC_COND: usize = 0;
const COARSE_COND: usize = 1;
const OUTPUT: usize = 2;

/// Generated semantic tokens plus how many steps produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticOutput {
    pub tokens: TokenSequence,
    pub steps_run: usize,
}

pub struct SemCoarseToSem {
    model: Arc<dyn TokenTransformer>,
    layout: TokenLayout,
    semantic_window: usize,
    coarse_window: usize,
}

impl SemCoarseToSem {
    /// `semantic_window` / `coarse_window` cap the conditioning frames kept
    /// from each input.
    pub fn new(
        model: Arc<dyn TokenTransformer>,
        semantic_codebook: usize,
        coarse_quantizers: usize,
        coarse_codebook: usize,
        semantic_window: usize,
        coarse_window: usize,
    ) -> Result<Self> {
        let layout = Self::layout(semantic_codebook, coarse_quantizers, coarse_codebook);
        check_vocab(&layout, model.vocab_size(), "semantic-from-vocal")?;
        Ok(Self {
            model,
            layout,
            semantic_window,
            coarse_window,
        })
    }

    pub fn layout(
        semantic_codebook: usize,
        coarse_quantizers: usize,
        coarse_codebook: usize,
    ) -> TokenLayout {
        TokenLayout::new(&[
            (1, semantic_codebook),
            (coarse_quantizers, coarse_codebook),
            (1, semantic_codebook),
        ])
    }

    /// Longest prefix the conditioning can occupy.
    fn max_prefix_len(&self) -> usize {
        let coarse_q = self.layout.segment(COARSE_COND).num_quantizers();
        self.semantic_window + 1 + self.coarse_window * coarse_q + 1
    }

    /// Largest `max_time_steps` that always fits the model context.
    pub fn max_steps(&self) -> usize {
        self.model.max_context().saturating_sub(self.max_prefix_len())
    }

    /// Produce exactly `max_time_steps` semantic tokens.
    pub fn generate(
        &self,
        vocal_semantic: &TokenSequence,
        vocal_coarse: &TokenSequence,
        max_time_steps: usize,
        sampler: &mut Sampler,
    ) -> Result<SemanticOutput> {
        let tag = |e: Error| match e {
            e @ Error::ModelInference { .. } => e,
            other => Error::inference(Stage::SemanticGeneration, other),
        };

        let semantic_seg = self.layout.segment(SEMANTIC_COND);
        let coarse_seg = self.layout.segment(COARSE_COND);
        let output_seg = self.layout.segment(OUTPUT);

        let mut prefix = semantic_seg
            .encode(&vocal_semantic.strip_eos().leading_frames(self.semantic_window))
            .map_err(tag)?;
        prefix.push(semantic_seg.eos_id());
        prefix.extend(
            coarse_seg
                .encode(&vocal_coarse.strip_eos().leading_frames(self.coarse_window))
                .map_err(tag)?,
        );
        prefix.push(coarse_seg.eos_id());

        if prefix.len() + max_time_steps > self.model.max_context() {
            return Err(Error::ParameterValidation(format!(
                "{max_time_steps} semantic steps exceed the model context of {}",
                self.model.max_context()
            )));
        }
        tracing::debug!(
            prefix_len = prefix.len(),
            steps = max_time_steps,
            "semantic-from-vocal generation"
        );

        let allowed = output_seg.quantizer_range(0);
        let base = allowed.start;
        let mut codes = Vec::with_capacity(max_time_steps);
        for _ in 0..max_time_steps {
            let logits = self.model.next_token_logits(&prefix).map_err(tag)?;
            let id = sampler.sample(&logits, allowed.clone()).map_err(tag)?;
            prefix.push(id as u32);
            codes.push((id - base) as u32);
        }

        let steps_run = codes.len();
        let tokens = TokenSequence::single(codes, output_seg.codebook_size()).map_err(tag)?;
        Ok(SemanticOutput { tokens, steps_run })
    }
}
