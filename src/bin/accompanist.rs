//! Accompanist CLI: generate an instrumental accompaniment for a vocal take.
//!
//! Reads a WAV file, runs the full pipeline once and writes
//! `<stem>_<timestamp>_generated.wav` into `--output-dir`. Progress goes to
//! stderr through `tracing`; stdout stays empty.
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use accompanist_rs::{
    config::{CheckpointPaths, ModelConfig, ServiceConfig, default_archive_dir},
    model::{preferred_device, registry::ModelRegistry},
    pipeline::Pipeline,
    request::{DEFAULT_PROMPT, GenerationParameters, UploadedAudio},
};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "accompanist",
    about = "Generate an instrumental accompaniment from a vocal recording",
    long_about = "Generate an instrumental accompaniment from a vocal recording.\n\
                  Only the first 10 seconds of the input are used."
)]
struct Args {
    /// Vocal recording (WAV).
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Directory the generated WAV is written to.
    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    /// Semantic tokens Stage 1 generates.
    #[arg(long, default_value_t = 2)]
    semantic_steps: usize,

    /// Seconds of accompaniment to budget for (multiplied by the factor).
    #[arg(long, short = 'd', default_value_t = 3)]
    duration: usize,

    /// Coarse frames generated per second of `--duration`.
    #[arg(long, default_value_t = 5)]
    time_steps_factor: usize,

    /// Sampling temperature in (0, 1].
    #[arg(long, short = 't', default_value_t = 0.95)]
    temperature: f64,

    /// Text describing the accompaniment.
    #[arg(long, short = 'p', default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Copy input, output and parameters into the evaluation archive.
    #[arg(long, default_value_t = false)]
    save_for_eval: bool,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Directory holding the model checkpoints.
    #[arg(long, default_value = "weights")]
    weights_dir: PathBuf,

    /// Base model document (JSON). Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Semantic-from-vocal model document (JSON).
    #[arg(long)]
    semcoarsetosem_config: Option<PathBuf>,

    /// Evaluation archive directory.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Scratch directory for per-request files.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// CUDA device ordinal (0 = first GPU).
    #[arg(long, default_value_t = 0)]
    cuda_device: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let bytes = std::fs::read(&args.input)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", args.input.display()))?;
    let filename = args
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input.wav".to_string());

    let model_config =
        ModelConfig::from_documents(args.config.as_deref(), args.semcoarsetosem_config.as_deref())?;
    let defaults = ServiceConfig::default();
    let service = ServiceConfig {
        work_dir: args.work_dir.unwrap_or(defaults.work_dir),
        archive_dir: args.archive_dir.unwrap_or_else(default_archive_dir),
        ..defaults
    };

    let device = preferred_device(args.cuda_device);
    tracing::info!("Using device: {:?}", device);
    let models = ModelRegistry::load(
        &model_config,
        &CheckpointPaths::in_dir(&args.weights_dir),
        &device,
    )
    .map_err(|e| anyhow::anyhow!("failed to load models: {e}"))?;
    let pipeline = Pipeline::new(models, &model_config, &service)?;

    let params = GenerationParameters {
        semantic_steps: args.semantic_steps,
        duration_seconds: args.duration,
        time_steps_factor: args.time_steps_factor,
        temperature: args.temperature,
        prompt: args.prompt,
        save_for_eval: args.save_for_eval,
        seed: args.seed,
    };

    let outcome = pipeline
        .handle_request(UploadedAudio::new(filename, bytes), params)
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;
    let path = outcome
        .persist_to(&args.output_dir)
        .map_err(|e| anyhow::anyhow!("failed to write output: {e}"))?;

    tracing::info!(
        path = %path.display(),
        duration_s = outcome.duration_secs(),
        sample_rate = outcome.sample_rate(),
        request_id = %outcome.request_id(),
        "accompaniment written"
    );

    Ok(())
}
