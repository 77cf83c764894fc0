//! Per-request inputs: parameters, the upload, and the scratch directory.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_PROMPT: &str = "Diverse kinds of instrument and richness";
pub const MAX_SEMANTIC_STEPS: usize = 4096;
pub const MAX_DURATION_SECONDS: usize = 600;

/// Caller-controlled generation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub semantic_steps: usize,
    #[serde(rename = "duration")]
    pub duration_seconds: usize,
    pub time_steps_factor: usize,
    pub temperature: f64,
    pub prompt: String,
    pub save_for_eval: bool,
    /// Fixed RNG seed for reproducible sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            semantic_steps: 2,
            duration_seconds: 3,
            time_steps_factor: 5,
            temperature: 0.95,
            prompt: DEFAULT_PROMPT.to_string(),
            save_for_eval: false,
            seed: None,
        }
    }
}

/// Model-dependent bounds the parameters are checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    /// Codec frames per second; `time_steps_factor` may not exceed it.
    pub codec_output_hz: u32,
    /// Most semantic tokens Stage 1 can produce.
    pub max_semantic_steps: usize,
    /// Coarse transformer context in tokens.
    pub coarse_max_context: usize,
    /// Text conditioning tokens in every coarse prefix.
    pub text_tokens: usize,
    /// Semantic conditioning frames kept by Stage 2.
    pub semantic_window: usize,
    pub coarse_quantizers: usize,
}

impl GenerationLimits {
    /// Coarse frames that fit after `semantic_steps` conditioning tokens
    /// and the semantic end marker.
    pub fn coarse_frames_for(&self, semantic_steps: usize) -> usize {
        let prefix = self.text_tokens + semantic_steps.min(self.semantic_window) + 1;
        self.coarse_max_context.saturating_sub(prefix) / self.coarse_quantizers.max(1)
    }
}

impl GenerationParameters {
    /// Coarse generation steps (codec frames).
    pub fn coarse_steps(&self) -> usize {
        self.duration_seconds * self.time_steps_factor
    }

    /// Trim the prompt and check every field. Runs before any model call.
    pub fn validate(mut self, limits: &GenerationLimits) -> Result<Self> {
        let invalid = |msg: String| Err(Error::ParameterValidation(msg));

        if !self.temperature.is_finite() || self.temperature <= 0.0 || self.temperature > 1.0 {
            return invalid(format!(
                "temperature must be in (0, 1], got {}",
                self.temperature
            ));
        }
        self.prompt = self.prompt.trim().to_string();
        if self.prompt.is_empty() {
            return invalid("prompt must not be empty".into());
        }
        if self.semantic_steps == 0 || self.semantic_steps > MAX_SEMANTIC_STEPS {
            return invalid(format!(
                "semantic_steps must be in 1..={MAX_SEMANTIC_STEPS}, got {}",
                self.semantic_steps
            ));
        }
        if self.semantic_steps > limits.max_semantic_steps {
            return invalid(format!(
                "semantic_steps {} exceeds the model limit of {}",
                self.semantic_steps, limits.max_semantic_steps
            ));
        }
        if self.duration_seconds == 0 || self.duration_seconds > MAX_DURATION_SECONDS {
            return invalid(format!(
                "duration must be in 1..={MAX_DURATION_SECONDS}, got {}",
                self.duration_seconds
            ));
        }
        let frame_rate = limits.codec_output_hz as usize;
        if self.time_steps_factor == 0 || self.time_steps_factor > frame_rate {
            return invalid(format!(
                "time_steps_factor must be in 1..={frame_rate} (codec frames per second), got {}",
                self.time_steps_factor
            ));
        }
        let max_frames = limits.coarse_frames_for(self.semantic_steps);
        if self.coarse_steps() > max_frames {
            return invalid(format!(
                "duration * time_steps_factor = {} exceeds the coarse model limit of {max_frames} frames",
                self.coarse_steps()
            ));
        }

        tracing::debug!(
            coarse_steps = self.coarse_steps(),
            expected_output_s = self.expected_output_seconds(frame_rate as u32),
            "parameters validated"
        );
        Ok(self)
    }

    /// Audio length the coarse budget decodes to.
    pub fn expected_output_seconds(&self, codec_output_hz: u32) -> f64 {
        self.coarse_steps() as f64 / codec_output_hz.max(1) as f64
    }
}

/// Raw upload as received.
#[derive(Debug, Clone)]
pub struct UploadedAudio {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedAudio {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Filename stem safe for use in output names: no path components,
    /// only `[A-Za-z0-9._-]`.
    pub fn stem(&self) -> String {
        let name = self
            .filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();
        let stem = match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        };
        let clean: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let clean = clean.trim_matches('.');
        if clean.is_empty() {
            "input".to_string()
        } else {
            clean.to_string()
        }
    }
}

/// Unique per-request identifier, safe as a path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Random UUID v4.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept a caller-chosen id matching `[A-Za-z0-9_-]{1,64}`.
    pub fn parse(id: &str) -> Result<Self> {
        let valid = (1..=64).contains(&id.len())
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::ParameterValidation(format!(
                "request id {id:?} must match [A-Za-z0-9_-]{{1,64}}"
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scratch tree `<work_dir>/<id>/{input,output}`, removed on drop.
#[derive(Debug)]
pub struct RequestContext {
    id: RequestId,
    root: PathBuf,
}

impl RequestContext {
    /// Create the tree. An existing directory for this id is an error, never
    /// reused.
    pub fn create(work_dir: &Path, id: RequestId) -> Result<Self> {
        std::fs::create_dir_all(work_dir).map_err(|e| Error::storage(work_dir, e))?;
        let root = work_dir.join(id.as_str());
        std::fs::create_dir(&root).map_err(|e| Error::storage(&root, e))?;
        // From here on, drop cleans up.
        let context = Self { id, root };
        for sub in ["input", "output"] {
            let dir = context.root.join(sub);
            std::fs::create_dir(&dir).map_err(|e| Error::storage(&dir, e))?;
        }
        Ok(context)
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!(request_id = %self.id, "removed request scratch tree"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                request_id = %self.id,
                path = %self.root.display(),
                "failed to remove request scratch tree: {e}"
            ),
        }
    }
}
