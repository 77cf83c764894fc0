//! Token extraction adapters.
//!
//! Each adapter is a thin call into one model handle. Any failure coming out
//! of the model is reported as [`Error::ModelInference`] tagged with the
//! adapter's stage.

use crate::audio::AudioBuffer;
use crate::error::Stage;
use crate::model::{AcousticCodec, SemanticModel, TextConditioner};
use crate::tokens::TokenSequence;
use crate::{Error, Result};

fn tagged<T>(stage: Stage, result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        e @ Error::ModelInference { .. } => e,
        other => Error::inference(stage, other),
    })
}

/// Semantic tokens, one per extractor output frame.
pub fn extract_semantic(audio: &AudioBuffer, model: &dyn SemanticModel) -> Result<TokenSequence> {
    if audio.sample_rate() != model.target_sample_rate() {
        return Err(Error::inference(
            Stage::SemanticExtraction,
            format!(
                "audio is {} Hz, extractor expects {} Hz",
                audio.sample_rate(),
                model.target_sample_rate()
            ),
        ));
    }
    let tokens = tagged(Stage::SemanticExtraction, model.tokenize(audio.samples()))?;
    tracing::debug!(frames = tokens.num_frames(), "semantic tokens");
    Ok(tokens)
}

/// The first `num_quantizers` codec levels and the residual they leave.
pub fn extract_coarse_acoustic(
    audio: &AudioBuffer,
    codec: &dyn AcousticCodec,
    num_quantizers: usize,
) -> Result<(TokenSequence, Vec<f32>)> {
    if audio.sample_rate() != codec.sample_rate() {
        return Err(Error::inference(
            Stage::CoarseExtraction,
            format!(
                "audio is {} Hz, codec expects {} Hz",
                audio.sample_rate(),
                codec.sample_rate()
            ),
        ));
    }
    let (tokens, residual) = tagged(
        Stage::CoarseExtraction,
        codec.encode(audio.samples(), num_quantizers),
    )?;
    if tokens.num_quantizers() != num_quantizers {
        return Err(Error::inference(
            Stage::CoarseExtraction,
            format!(
                "codec returned {} levels, asked for {num_quantizers}",
                tokens.num_quantizers()
            ),
        ));
    }
    tracing::debug!(
        frames = tokens.num_frames(),
        quantizers = num_quantizers,
        "coarse tokens"
    );
    Ok((tokens, residual))
}

/// Conditioning tokens from the text branch only.
pub fn extract_text_tokens(prompt: &str, model: &dyn TextConditioner) -> Result<TokenSequence> {
    let tokens = tagged(Stage::TextExtraction, model.tokenize_text(prompt))?;
    tracing::debug!(codes = tokens.len(), "text tokens");
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenText;

    impl TextConditioner for BrokenText {
        fn codebook_size(&self) -> usize {
            1024
        }
        fn num_quantizers(&self) -> usize {
            12
        }
        fn tokenize_text(&self, _: &str) -> Result<TokenSequence> {
            Err(Error::Config("tokenizer missing".into()))
        }
    }

    /// Codec that always returns every level it has.
    struct GreedyCodec;

    impl AcousticCodec for GreedyCodec {
        fn sample_rate(&self) -> u32 {
            24_000
        }
        fn output_hz(&self) -> u32 {
            75
        }
        fn codebook_size(&self) -> usize {
            1024
        }
        fn encode(&self, _: &[f32], _: usize) -> Result<(TokenSequence, Vec<f32>)> {
            Ok((TokenSequence::new(vec![0; 8], 8, 1024)?, Vec::new()))
        }
        fn decode(&self, _: &TokenSequence) -> Result<Vec<f32>> {
            Ok(Vec::new())
        }
    }

    struct ConstSemantic;

    impl SemanticModel for ConstSemantic {
        fn target_sample_rate(&self) -> u32 {
            16_000
        }
        fn output_hz(&self) -> u32 {
            50
        }
        fn codebook_size(&self) -> usize {
            1024
        }
        fn tokenize(&self, samples: &[f32]) -> Result<TokenSequence> {
            TokenSequence::single(vec![7; samples.len() / 320], 1024)
        }
    }

    #[test]
    fn text_failure_is_tagged() {
        let err = extract_text_tokens("piano", &BrokenText).unwrap_err();
        match err {
            Error::ModelInference { stage, message } => {
                assert_eq!(stage, Stage::TextExtraction);
                assert!(message.contains("tokenizer missing"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn coarse_extraction_refuses_fine_levels() {
        let audio = AudioBuffer::mono(vec![0.0; 2400], 24_000).unwrap();
        let err = extract_coarse_acoustic(&audio, &GreedyCodec, 3).unwrap_err();
        assert!(matches!(
            err,
            Error::ModelInference {
                stage: Stage::CoarseExtraction,
                ..
            }
        ));
    }

    #[test]
    fn semantic_rate_mismatch_is_tagged() {
        let audio = AudioBuffer::mono(vec![0.0; 4410], 44_100).unwrap();
        let err = extract_semantic(&audio, &ConstSemantic).unwrap_err();
        assert!(matches!(
            err,
            Error::ModelInference {
                stage: Stage::SemanticExtraction,
                ..
            }
        ));
    }

    #[test]
    fn semantic_tokens_pass_through() {
        let audio = AudioBuffer::mono(vec![0.0; 16_000], 16_000).unwrap();
        let tokens = extract_semantic(&audio, &ConstSemantic).unwrap();
        assert_eq!(tokens.num_frames(), 50);
    }
}
