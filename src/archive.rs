//! Durable evaluation archive.
//!
//! ```text
//! {archive_dir}/{request_id}_input.wav
//! {archive_dir}/{request_id}_output.wav
//! {archive_dir}/{request_id}_metadata.json
//! ```
//!
//! Entries outlive the request's scratch tree. Writing an entry is
//! all-or-nothing: if any file fails, the ones already written are removed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::request::{GenerationParameters, RequestId};
use crate::{Error, Result};

/// Metadata record stored next to the archived audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalArchiveEntry {
    pub request_id: RequestId,
    /// ISO-8601 / RFC 3339.
    pub timestamp: String,
    pub input_file: String,
    pub output_file: String,
    /// Name the caller uploaded.
    pub source_filename: String,
    pub parameters: GenerationParameters,
}

/// Writes [`EvalArchiveEntry`] records and their audio.
#[derive(Debug, Clone)]
pub struct EvalArchive {
    dir: PathBuf,
}

/// Removes the listed files unless disarmed.
struct PartialWrite {
    written: Vec<PathBuf>,
}

impl Drop for PartialWrite {
    fn drop(&mut self) {
        for path in &self.written {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), "failed to roll back archive file: {e}");
            }
        }
    }
}

impl EvalArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_name(id: &RequestId) -> String {
        format!("{id}_input.wav")
    }

    pub fn output_name(id: &RequestId) -> String {
        format!("{id}_output.wav")
    }

    pub fn metadata_name(id: &RequestId) -> String {
        format!("{id}_metadata.json")
    }

    /// Copy input and output into the archive and write the metadata record.
    pub fn store(
        &self,
        id: &RequestId,
        input: &Path,
        output: &Path,
        source_filename: &str,
        parameters: &GenerationParameters,
    ) -> Result<EvalArchiveEntry> {
        std::fs::create_dir_all(&self.dir).map_err(|e| Error::storage(&self.dir, e))?;

        let entry = EvalArchiveEntry {
            request_id: id.clone(),
            timestamp: chrono::Local::now().to_rfc3339(),
            input_file: Self::input_name(id),
            output_file: Self::output_name(id),
            source_filename: source_filename.to_string(),
            parameters: parameters.clone(),
        };

        let mut partial = PartialWrite {
            written: Vec::with_capacity(3),
        };
        for (src, name) in [(input, &entry.input_file), (output, &entry.output_file)] {
            let dest = self.dir.join(name);
            copy_new(src, &dest)?;
            partial.written.push(dest);
        }

        let metadata_path = self.dir.join(Self::metadata_name(id));
        let json = serde_json::to_vec_pretty(&entry)?;
        write_new(&metadata_path, &json)?;
        partial.written.clear();

        tracing::info!(
            request_id = %id,
            dir = %self.dir.display(),
            "archived request for evaluation"
        );
        Ok(entry)
    }

    /// Read back a stored record.
    pub fn load_entry(&self, id: &RequestId) -> Result<EvalArchiveEntry> {
        let path = self.dir.join(Self::metadata_name(id));
        let bytes = std::fs::read(&path).map_err(|e| Error::storage(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Fail instead of overwriting another request's archive file.
fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::storage(path, e))?;
    file.write_all(bytes).map_err(|e| Error::storage(path, e))
}

fn copy_new(src: &Path, dest: &Path) -> Result<()> {
    let bytes = std::fs::read(src).map_err(|e| Error::storage(src, e))?;
    write_new(dest, &bytes)
}
