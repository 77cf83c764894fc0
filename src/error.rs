//! Error types for accompanist-rs.

use std::fmt;
use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The uploaded audio could not be decoded.
    #[error("audio format: {0}")]
    AudioFormat(String),

    /// Preprocessing left no samples to work with.
    #[error("audio is empty after preprocessing")]
    EmptyAudio,

    /// Out-of-range generation parameters.
    #[error("invalid parameter: {0}")]
    ParameterValidation(String),

    /// A model call failed. `stage` names the pipeline step for diagnostics.
    #[error("model inference failed in {stage}: {message}")]
    ModelInference { stage: Stage, message: String },

    /// Temp-tree or archive file operation failed.
    #[error("storage: {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Candle tensor/model error outside of a tagged stage.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The generation manager is gone or its worker panicked.
    #[error("manager: {0}")]
    Manager(String),
}

impl Error {
    /// Tag an arbitrary model failure with the stage it happened in.
    pub fn inference(stage: Stage, error: impl fmt::Display) -> Self {
        Error::ModelInference {
            stage,
            message: error.to_string(),
        }
    }

    /// Wrap an I/O failure on `path` as a storage error.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    /// True when the request itself was at fault (bad audio or parameters).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::AudioFormat(_) | Error::EmptyAudio | Error::ParameterValidation(_)
        )
    }
}

/// Pipeline step a model failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SemanticExtraction,
    CoarseExtraction,
    TextExtraction,
    SemanticGeneration,
    CoarseGeneration,
    WaveformReconstruction,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SemanticExtraction => "semantic extraction",
            Stage::CoarseExtraction => "coarse extraction",
            Stage::TextExtraction => "text extraction",
            Stage::SemanticGeneration => "semantic generation",
            Stage::CoarseGeneration => "coarse generation",
            Stage::WaveformReconstruction => "waveform reconstruction",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::AudioFormat(error.to_string())
    }
}
