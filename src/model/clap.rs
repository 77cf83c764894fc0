//! CLAP text branch + residual VQ: conditioning tokens from a prompt.
//!
//! Only the text tower runs at inference. The prompt is tokenized, encoded
//! by a RoBERTa model, pooled from the first token, projected into the joint
//! audio-text space, L2-normalized and quantized by the residual VQ.

use std::path::Path;

use candle_core::{D, DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert;
use tokenizers::Tokenizer;

use crate::config::ClapRvqConfig;
use crate::model::TextConditioner;
use crate::model::quantizer::ResidualVq;
use crate::tokens::TokenSequence;
use crate::{Error, Result};

/// Width of the joint embedding space.
pub const JOINT_DIM: usize = 512;
/// CLAP pads/truncates prompts to this many tokens.
pub const MAX_TEXT_TOKENS: usize = 77;

pub struct ClapText {
    encoder: bert::BertModel,
    pooler: candle_nn::Linear,
    projection_in: candle_nn::Linear,
    projection_out: candle_nn::Linear,
    rvq: ResidualVq,
    tokenizer: Option<Tokenizer>,
    config: ClapRvqConfig,
    device: Device,
}

impl ClapText {
    /// Build from var builders: `vb` for the text tower and projection,
    /// `rvq_vb` for the quantizer.
    pub fn new(
        vb: VarBuilder,
        rvq_vb: VarBuilder,
        bert_config: &bert::Config,
        config: &ClapRvqConfig,
        joint_dim: usize,
    ) -> Result<Self> {
        let hidden = bert_config.hidden_size;
        let encoder = bert::BertModel::load(vb.pp("text_branch"), bert_config)?;
        let pooler = candle_nn::linear(hidden, hidden, vb.pp("text_branch.pooler.dense"))?;
        let projection_in = candle_nn::linear(hidden, joint_dim, vb.pp("text_projection.0"))?;
        let projection_out =
            candle_nn::linear(joint_dim, joint_dim, vb.pp("text_projection.2"))?;
        let rvq = ResidualVq::load(
            rvq_vb,
            config.rq_num_quantizers,
            config.codebook_size,
            joint_dim,
        )?;
        Ok(Self {
            encoder,
            pooler,
            projection_in,
            projection_out,
            rvq,
            tokenizer: None,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn with_tokenizer(mut self, tokenizer: Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Load weights, model config and tokenizer from disk.
    pub fn load(
        weights: &Path,
        bert_config: &Path,
        tokenizer: &Path,
        rvq_weights: &Path,
        config: &ClapRvqConfig,
        device: &Device,
    ) -> Result<Self> {
        let text =
            std::fs::read_to_string(bert_config).map_err(|e| Error::storage(bert_config, e))?;
        let bert_cfg: bert::Config = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", bert_config.display())))?;

        tracing::info!("Loading CLAP text weights from {:?}", weights);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)
                .map_err(|e| Error::WeightLoad(format!("CLAP text weights: {e}")))?
        };
        let rvq_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[rvq_weights], DType::F32, device)
                .map_err(|e| Error::WeightLoad(format!("CLAP RVQ weights: {e}")))?
        };
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(|e| Error::WeightLoad(format!("CLAP tokenizer load: {e}")))?;

        Ok(Self::new(vb, rvq_vb, &bert_cfg, config, JOINT_DIM)?.with_tokenizer(tokenizer))
    }

    /// Normalized joint-space embedding `[1, joint_dim]` for token ids.
    pub fn embed_ids(&self, ids: &[u32]) -> Result<Tensor> {
        let len = ids.len().min(MAX_TEXT_TOKENS);
        let input_ids = Tensor::from_slice(&ids[..len], (1, len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let attention_mask = input_ids.ones_like()?;
        let hidden = self
            .encoder
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        let cls = hidden.i((.., 0))?; // [1, hidden]
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let x = self.projection_in.forward(&pooled)?.relu()?;
        let x = self.projection_out.forward(&x)?.to_dtype(DType::F32)?;

        let norm = x
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .sqrt()?
            .clamp(1e-12, f64::INFINITY)?;
        Ok(x.broadcast_div(&norm)?)
    }

    /// Conditioning tokens for already-tokenized text.
    pub fn tokenize_ids(&self, ids: &[u32]) -> Result<TokenSequence> {
        if ids.is_empty() {
            return Err(Error::ParameterValidation("prompt produced no tokens".into()));
        }
        let embedding = self.embed_ids(ids)?;
        let (codes, _residual) = self.rvq.encode(&embedding)?;
        TokenSequence::new(codes, self.rvq.num_quantizers(), self.config.codebook_size)
    }
}

impl TextConditioner for ClapText {
    fn codebook_size(&self) -> usize {
        self.config.codebook_size
    }

    fn num_quantizers(&self) -> usize {
        self.config.rq_num_quantizers
    }

    fn tokenize_text(&self, text: &str) -> Result<TokenSequence> {
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or_else(|| Error::Config("CLAP text model has no tokenizer".into()))?;
        let encoding = tokenizer.encode(text, true)?;
        tracing::debug!(tokens = encoding.len(), "prompt tokenized");
        self.tokenize_ids(encoding.get_ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_bert() -> bert::Config {
        serde_json::from_str(
            r#"{
                "vocab_size": 32,
                "hidden_size": 16,
                "num_hidden_layers": 1,
                "num_attention_heads": 2,
                "intermediate_size": 32,
                "hidden_act": "gelu",
                "hidden_dropout_prob": 0.0,
                "max_position_embeddings": 80,
                "type_vocab_size": 1,
                "initializer_range": 0.02,
                "layer_norm_eps": 1e-5,
                "pad_token_id": 1,
                "position_embedding_type": "absolute",
                "use_cache": false,
                "classifier_dropout": null,
                "model_type": "roberta"
            }"#,
        )
        .unwrap()
    }

    fn tiny_clap() -> ClapText {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let rvq_map = VarMap::new();
        let rvq_vb = VarBuilder::from_varmap(&rvq_map, DType::F32, &device);
        let config = ClapRvqConfig {
            rq_num_quantizers: 3,
            codebook_size: 8,
            ..ClapRvqConfig::default()
        };
        ClapText::new(vb, rvq_vb, &tiny_bert(), &config, 16).unwrap()
    }

    #[test]
    fn one_frame_of_all_quantizers() {
        let clap = tiny_clap();
        let tokens = clap.tokenize_ids(&[0, 5, 9, 2]).unwrap();
        assert_eq!(tokens.num_quantizers(), 3);
        assert_eq!(tokens.num_frames(), 1);
        assert!(tokens.codes().iter().all(|&c| c < 8));
    }

    #[test]
    fn long_prompts_are_truncated() {
        let clap = tiny_clap();
        let ids: Vec<u32> = (0..200).map(|i| i % 32).collect();
        assert!(clap.tokenize_ids(&ids).is_ok());
    }

    #[test]
    fn text_without_tokenizer_is_config_error() {
        let clap = tiny_clap();
        assert!(matches!(
            clap.tokenize_text("piano"),
            Err(Error::Config(_))
        ));
    }
}
