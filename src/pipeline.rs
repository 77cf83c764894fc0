//! Request orchestrator.
//!
//! One call to [`Pipeline::handle_request`] runs the whole chain:
//! 1. Validate parameters (before anything touches disk or a model)
//! 2. Create the request scratch tree and persist the upload
//! 3. Preprocess: mono, first 10 s, codec / extractor copies
//! 4. Extract semantic, coarse and text tokens (optionally in parallel)
//! 5. Stage 1: instrumental semantic tokens
//! 6. Stage 2: coarse tokens, decoded to a waveform
//! 7. Write `{stem}_{timestamp}_generated.wav`, archive if asked
//!
//! Every failure after step 2 drops the [`RequestContext`], which removes
//! the scratch tree before the error reaches the caller. On success the
//! context moves into the [`GenerationOutcome`], so the output file lives
//! exactly as long as the caller holds it.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::archive::{EvalArchive, EvalArchiveEntry};
use crate::audio::{self, Preprocessor};
use crate::config::{ModelConfig, ServiceConfig};
use crate::error::Stage;
use crate::extract;
use crate::generation::{CoarseOptions, CoarseStage, GeneratedWaveform, SemCoarseToSem, Sampler};
use crate::model::ModelSet;
use crate::request::{
    GenerationLimits, GenerationParameters, RequestContext, RequestId, UploadedAudio,
};
use crate::tokens::TokenSequence;
use crate::{Error, Result};

/// Steps each generation stage actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    pub semantic_steps: usize,
    pub coarse_steps: usize,
}

/// A finished request. Dropping it removes the scratch tree, output included.
#[derive(Debug)]
pub struct GenerationOutcome {
    context: RequestContext,
    output_path: PathBuf,
    file_name: String,
    sample_rate: u32,
    num_samples: usize,
    stats: StageStats,
    archive_entry: Option<EvalArchiveEntry>,
}

impl GenerationOutcome {
    pub fn request_id(&self) -> &RequestId {
        self.context.id()
    }

    /// Generated WAV inside the scratch tree.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// `{stem}_{timestamp}_generated.wav`
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.num_samples as f64 / self.sample_rate as f64
    }

    pub fn stats(&self) -> StageStats {
        self.stats
    }

    pub fn archive_entry(&self) -> Option<&EvalArchiveEntry> {
        self.archive_entry.as_ref()
    }

    /// Copy the output into `dir` under the same file name.
    pub fn persist_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| Error::storage(dir, e))?;
        let dest = dir.join(&self.file_name);
        std::fs::copy(&self.output_path, &dest).map_err(|e| Error::storage(&dest, e))?;
        Ok(dest)
    }
}

/// Tokens from the three extractors.
struct Extracted {
    semantic: TokenSequence,
    coarse: TokenSequence,
    text: TokenSequence,
}

/// Orchestrates one request end to end over shared, read-only models.
pub struct Pipeline {
    models: ModelSet,
    preprocessor: Preprocessor,
    semcoarsetosem: SemCoarseToSem,
    coarse: CoarseStage,
    coarse_quantizers: usize,
    limits: GenerationLimits,
    work_dir: PathBuf,
    archive: EvalArchive,
    parallel_extraction: bool,
}

impl Pipeline {
    pub fn new(models: ModelSet, config: &ModelConfig, service: &ServiceConfig) -> Result<Self> {
        let coarse_quantizers = config.global_cfg.num_coarse_quantizers;
        let semantic_window = config.semantic_window_frames();

        let semcoarsetosem = SemCoarseToSem::new(
            models.semcoarsetosem.clone(),
            models.semantic.codebook_size(),
            coarse_quantizers,
            models.codec.codebook_size(),
            semantic_window,
            config.coarse_window_frames(),
        )?;
        let coarse = CoarseStage::new(
            models.coarse.clone(),
            models.codec.clone(),
            models.text.num_quantizers(),
            models.text.codebook_size(),
            models.semantic.codebook_size(),
            coarse_quantizers,
            semantic_window,
        )?;
        let limits = GenerationLimits {
            codec_output_hz: models.codec.output_hz(),
            max_semantic_steps: semcoarsetosem.max_steps(),
            coarse_max_context: models.coarse.max_context(),
            text_tokens: models.text.num_quantizers(),
            semantic_window,
            coarse_quantizers,
        };
        let preprocessor = Preprocessor::new(
            models.codec.sample_rate(),
            models.semantic.target_sample_rate(),
        );

        tracing::debug!(?limits, "pipeline ready");
        Ok(Self {
            models,
            preprocessor,
            semcoarsetosem,
            coarse,
            coarse_quantizers,
            limits,
            work_dir: service.work_dir.clone(),
            archive: EvalArchive::new(&service.archive_dir),
            parallel_extraction: service.parallel_extraction,
        })
    }

    pub fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    pub fn archive(&self) -> &EvalArchive {
        &self.archive
    }

    /// Run one request under a fresh random id.
    pub fn handle_request(
        &self,
        upload: UploadedAudio,
        params: GenerationParameters,
    ) -> Result<GenerationOutcome> {
        self.handle_request_with_id(RequestId::generate(), upload, params)
    }

    /// Run one request under a caller-chosen id.
    pub fn handle_request_with_id(
        &self,
        id: RequestId,
        upload: UploadedAudio,
        params: GenerationParameters,
    ) -> Result<GenerationOutcome> {
        let start = Instant::now();
        let params = params.validate(&self.limits)?;
        let span = tracing::info_span!("request", request_id = %id);
        let _enter = span.enter();

        let context = RequestContext::create(&self.work_dir, id)?;
        let stem = upload.stem();
        tracing::info!(
            filename = %upload.filename,
            bytes = upload.bytes.len(),
            semantic_steps = params.semantic_steps,
            coarse_steps = params.coarse_steps(),
            expected_output_s = params.expected_output_seconds(self.limits.codec_output_hz),
            "handling request"
        );

        let input_path = context.input_dir().join(format!("{stem}.wav"));
        std::fs::write(&input_path, &upload.bytes).map_err(|e| Error::storage(&input_path, e))?;

        let raw = audio::decode_wav(&upload.bytes)?;
        tracing::debug!(
            channels = raw.channels(),
            sample_rate = raw.sample_rate(),
            duration_s = raw.duration_secs(),
            "decoded upload"
        );
        let prepared = self.preprocessor.prepare(raw)?;

        let extracted = self.extract(&prepared.for_extractor, &prepared.for_codec, &params.prompt)?;
        tracing::info!(
            semantic_frames = extracted.semantic.num_frames(),
            coarse_frames = extracted.coarse.num_frames(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "tokens extracted"
        );

        let mut sampler = Sampler::new(params.temperature, params.seed)?;
        let semantic = self.semcoarsetosem.generate(
            &extracted.semantic,
            &extracted.coarse,
            params.semantic_steps,
            &mut sampler,
        )?;
        tracing::info!(
            steps = semantic.steps_run,
            elapsed_s = start.elapsed().as_secs_f64(),
            "semantic generation done"
        );

        let coarse = self.coarse.generate(
            &extracted.text,
            &semantic.tokens,
            CoarseOptions::for_request(params.coarse_steps()),
            &mut sampler,
        )?;
        let waveform = coarse.waveform.ok_or_else(|| {
            Error::inference(Stage::WaveformReconstruction, "no waveform reconstructed")
        })?;
        tracing::info!(
            steps = coarse.steps_run,
            duration_s = waveform.duration_secs(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "coarse generation done"
        );

        let file_name = output_file_name(&stem, chrono::Local::now());
        let output_path = context.output_dir().join(&file_name);
        write_waveform(&output_path, &waveform)?;

        let archive_entry = if params.save_for_eval {
            Some(self.archive.store(
                context.id(),
                &input_path,
                &output_path,
                &upload.filename,
                &params,
            )?)
        } else {
            None
        };

        tracing::info!(
            output = %file_name,
            elapsed_s = start.elapsed().as_secs_f64(),
            "request complete"
        );
        Ok(GenerationOutcome {
            context,
            output_path,
            file_name,
            sample_rate: waveform.sample_rate,
            num_samples: waveform.samples.len(),
            stats: StageStats {
                semantic_steps: semantic.steps_run,
                coarse_steps: coarse.steps_run,
            },
            archive_entry,
        })
    }

    /// The three extractions are independent; fan them out when enabled.
    fn extract(
        &self,
        for_extractor: &audio::AudioBuffer,
        for_codec: &audio::AudioBuffer,
        prompt: &str,
    ) -> Result<Extracted> {
        let semantic_model = self.models.semantic.as_ref();
        let codec = self.models.codec.as_ref();
        let text_model = self.models.text.as_ref();
        let q = self.coarse_quantizers;

        let (semantic, coarse, text) = if self.parallel_extraction {
            std::thread::scope(|scope| {
                let semantic =
                    scope.spawn(|| extract::extract_semantic(for_extractor, semantic_model));
                let coarse = scope.spawn(|| extract::extract_coarse_acoustic(for_codec, codec, q));
                let text = extract::extract_text_tokens(prompt, text_model);
                let semantic = semantic.join().map_err(|_| {
                    Error::inference(Stage::SemanticExtraction, "extraction thread panicked")
                });
                let coarse = coarse.join().map_err(|_| {
                    Error::inference(Stage::CoarseExtraction, "extraction thread panicked")
                });
                (semantic, coarse, text)
            })
        } else {
            (
                Ok(extract::extract_semantic(for_extractor, semantic_model)),
                Ok(extract::extract_coarse_acoustic(for_codec, codec, q)),
                extract::extract_text_tokens(prompt, text_model),
            )
        };

        let semantic = semantic??;
        let (coarse, _residual) = coarse??;
        Ok(Extracted {
            semantic,
            coarse,
            text: text?,
        })
    }
}

/// `{stem}_{YYYYmmdd_HHMMSS}_generated.wav`
pub fn output_file_name<Tz: chrono::TimeZone>(stem: &str, at: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{stem}_{}_generated.wav", at.format("%Y%m%d_%H%M%S"))
}

fn write_waveform(path: &Path, waveform: &GeneratedWaveform) -> Result<()> {
    if waveform.samples.is_empty() {
        return Err(Error::inference(
            Stage::WaveformReconstruction,
            "codec produced an empty waveform",
        ));
    }
    audio::write_wav(path, &waveform.samples, waveform.sample_rate, 1)
}
