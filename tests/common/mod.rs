//! Lightweight stand-ins for the five model handles.
//!
//! Shapes follow the real models (16 kHz / 50 Hz extractor, 24 kHz / 75 Hz
//! codec) with tiny codebooks so requests finish in milliseconds.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use accompanist_rs::config::{ModelConfig, ServiceConfig};
use accompanist_rs::model::{
    AcousticCodec, ModelSet, SemanticModel, TextConditioner, TokenTransformer,
};
use accompanist_rs::tokens::TokenSequence;
use accompanist_rs::{Error, Result, Stage};

pub const SEMANTIC_CODEBOOK: usize = 16;
pub const CODEC_CODEBOOK: usize = 32;
pub const CODEC_RATE: u32 = 24_000;
pub const CODEC_HOP: usize = 320;
pub const TEXT_QUANTIZERS: usize = 4;

/// Shared observation points for every fake.
#[derive(Debug, Default, Clone)]
pub struct Counters {
    /// Calls into any model handle.
    pub model_calls: Arc<AtomicUsize>,
    /// Largest sample count the semantic extractor received.
    pub semantic_input_len: Arc<AtomicUsize>,
    /// Largest sample count the codec encoder received.
    pub codec_input_len: Arc<AtomicUsize>,
    /// Codec decodes, one per finished generation.
    pub decodes: Arc<AtomicUsize>,
    /// Stage 1 transformer calls running right now.
    pub in_flight: Arc<AtomicUsize>,
    /// Most Stage 1 transformer calls ever seen running together.
    pub peak_in_flight: Arc<AtomicUsize>,
}

impl Counters {
    pub fn model_calls(&self) -> usize {
        self.model_calls.load(Ordering::SeqCst)
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.model_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeSemantic {
    counters: Counters,
    fail: bool,
}

impl SemanticModel for FakeSemantic {
    fn target_sample_rate(&self) -> u32 {
        16_000
    }
    fn output_hz(&self) -> u32 {
        50
    }
    fn codebook_size(&self) -> usize {
        SEMANTIC_CODEBOOK
    }
    fn tokenize(&self, samples: &[f32]) -> Result<TokenSequence> {
        self.counters.hit();
        self.counters
            .semantic_input_len
            .fetch_max(samples.len(), Ordering::SeqCst);
        if self.fail {
            return Err(Error::inference(Stage::SemanticExtraction, "encoder exploded"));
        }
        let frames = samples.len() / 320;
        let codes = (0..frames)
            .map(|i| (i % SEMANTIC_CODEBOOK) as u32)
            .collect();
        TokenSequence::single(codes, SEMANTIC_CODEBOOK)
    }
}

struct FakeCodec {
    counters: Counters,
}

impl AcousticCodec for FakeCodec {
    fn sample_rate(&self) -> u32 {
        CODEC_RATE
    }
    fn output_hz(&self) -> u32 {
        75
    }
    fn codebook_size(&self) -> usize {
        CODEC_CODEBOOK
    }
    fn encode(&self, samples: &[f32], num_quantizers: usize) -> Result<(TokenSequence, Vec<f32>)> {
        self.counters.hit();
        self.counters
            .codec_input_len
            .fetch_max(samples.len(), Ordering::SeqCst);
        let frames = samples.len().div_ceil(CODEC_HOP);
        let codes = (0..frames * num_quantizers)
            .map(|i| (i % CODEC_CODEBOOK) as u32)
            .collect();
        let tokens = TokenSequence::new(codes, num_quantizers, CODEC_CODEBOOK)?;
        Ok((tokens, vec![0.0; samples.len()]))
    }
    fn decode(&self, tokens: &TokenSequence) -> Result<Vec<f32>> {
        self.counters.hit();
        self.counters.decodes.fetch_add(1, Ordering::SeqCst);
        let mut samples = Vec::with_capacity(tokens.num_frames() * CODEC_HOP);
        for frame in tokens.frames() {
            let level = frame[0] as f32 / CODEC_CODEBOOK as f32;
            samples.extend((0..CODEC_HOP).map(|i| 0.1 * level * (i as f32 * 0.05).sin()));
        }
        Ok(samples)
    }
}

struct FakeText {
    counters: Counters,
}

impl TextConditioner for FakeText {
    fn codebook_size(&self) -> usize {
        CODEC_CODEBOOK
    }
    fn num_quantizers(&self) -> usize {
        TEXT_QUANTIZERS
    }
    fn tokenize_text(&self, text: &str) -> Result<TokenSequence> {
        self.counters.hit();
        let seed = text.len() as u32;
        let codes = (0..TEXT_QUANTIZERS as u32)
            .map(|q| (seed + q) % CODEC_CODEBOOK as u32)
            .collect();
        TokenSequence::new(codes, TEXT_QUANTIZERS, CODEC_CODEBOOK)
    }
}

/// How long each Stage 1 transformer call holds its slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pacing {
    /// Upper bound on the time one call stays in flight.
    pub hold: Duration,
    /// Leave early once this many calls are in flight together.
    pub rendezvous: usize,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }

    fn current(&self) -> usize {
        self.0.in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Flat logits over a vocabulary large enough for either stage.
struct FlatTransformer {
    counters: Counters,
    pacing: Option<Pacing>,
}

impl TokenTransformer for FlatTransformer {
    fn vocab_size(&self) -> usize {
        512
    }
    fn max_context(&self) -> usize {
        100_000
    }
    fn next_token_logits(&self, prefix: &[u32]) -> Result<Vec<f32>> {
        self.counters.hit();
        assert!(!prefix.is_empty());
        if let Some(pacing) = self.pacing {
            let guard = InFlight::enter(&self.counters);
            let deadline = Instant::now() + pacing.hold;
            while Instant::now() < deadline
                && (pacing.rendezvous < 2 || guard.current() < pacing.rendezvous)
            {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(vec![0.0; self.vocab_size()])
    }
}

pub fn models(counters: &Counters) -> ModelSet {
    build(counters, false, None)
}

/// Same as [`models`], but the semantic extractor always fails.
pub fn failing_models(counters: &Counters) -> ModelSet {
    build(counters, true, None)
}

/// Same as [`models`], but Stage 1 calls are slowed down and counted while
/// they run.
pub fn paced_models(counters: &Counters, pacing: Pacing) -> ModelSet {
    build(counters, false, Some(pacing))
}

fn build(counters: &Counters, fail_semantic: bool, pacing: Option<Pacing>) -> ModelSet {
    ModelSet {
        semantic: Arc::new(FakeSemantic {
            counters: counters.clone(),
            fail: fail_semantic,
        }),
        codec: Arc::new(FakeCodec {
            counters: counters.clone(),
        }),
        text: Arc::new(FakeText {
            counters: counters.clone(),
        }),
        semcoarsetosem: Arc::new(FlatTransformer {
            counters: counters.clone(),
            pacing,
        }),
        coarse: Arc::new(FlatTransformer {
            counters: counters.clone(),
            pacing: None,
        }),
    }
}

pub fn model_config() -> ModelConfig {
    ModelConfig::default()
}

pub fn service_config(work_dir: &Path, archive_dir: &Path) -> ServiceConfig {
    ServiceConfig {
        work_dir: work_dir.to_path_buf(),
        archive_dir: archive_dir.to_path_buf(),
        ..ServiceConfig::default()
    }
}

/// 16-bit PCM WAV of a 220 Hz tone.
pub fn tone_wav(seconds: f32, sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * sample_rate as f32) as usize;
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let value = (0.3 * (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 32767.0) as i16;
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// File names directly under `dir`, sorted. Missing dir reads as empty.
pub fn entries(dir: &Path) -> Vec<String> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = read
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Poll `done` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    done()
}
