//! Partial-result hooks for long generation runs.
//!
//! The evaluator reports every finished generation through [`CacheHook`]
//! as soon as it completes. [`PartialResultLog`] persists those reports as
//! JSON Lines (`{"kind": ..., "request": ..., "result": ...}`) so an
//! interrupted run can be resumed.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::request::GenerationRequest;

/// Kind tag recorded for greedy generation results.
pub const GREEDY_UNTIL: &str = "greedy_until";

/// Receives each completed generation. Implementations must not fail the
/// evaluation; errors are theirs to report.
pub trait CacheHook {
    fn add_partial(&mut self, kind: &str, request: &GenerationRequest, result: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl CacheHook for NoCache {
    fn add_partial(&mut self, _kind: &str, _request: &GenerationRequest, _result: &str) {}
}

impl<F> CacheHook for F
where
    F: FnMut(&str, &GenerationRequest, &str),
{
    fn add_partial(&mut self, kind: &str, request: &GenerationRequest, result: &str) {
        self(kind, request, result)
    }
}

/// One line of a partial-result log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialEntry {
    pub kind: String,
    pub request: GenerationRequest,
    pub result: String,
}

/// Append-only JSON Lines log of completed generations.
#[derive(Debug)]
pub struct PartialResultLog {
    path: PathBuf,
    writer: BufWriter<File>,
    written: usize,
}

impl PartialResultLog {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries appended through this handle.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Read every entry from a log file.
    ///
    /// Blank lines are skipped, as are lines that fail to parse (a run killed
    /// mid-write leaves a truncated last line).
    pub fn load(path: &Path) -> anyhow::Result<Vec<PartialEntry>> {
        let file = File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut entries = Vec::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<PartialEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    "Skipping unreadable line {} of {:?}: {}",
                    lineno + 1,
                    path,
                    e
                ),
            }
        }

        Ok(entries)
    }

    /// Load the greedy generation results recorded in `path`, keyed by
    /// request. Later entries win.
    pub fn load_generations(path: &Path) -> anyhow::Result<HashMap<GenerationRequest, String>> {
        Ok(Self::load(path)?
            .into_iter()
            .filter(|entry| entry.kind == GREEDY_UNTIL)
            .map(|entry| (entry.request, entry.result))
            .collect())
    }

    fn append(&mut self, entry: &PartialEntry) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        // flushed per entry so a crash loses at most the line in flight
        self.writer.flush()?;
        Ok(())
    }
}

impl CacheHook for PartialResultLog {
    fn add_partial(&mut self, kind: &str, request: &GenerationRequest, result: &str) {
        let entry = PartialEntry {
            kind: kind.to_string(),
            request: request.clone(),
            result: result.to_string(),
        };
        match self.append(&entry) {
            Ok(()) => self.written += 1,
            Err(e) => tracing::warn!("Failed to record partial result to {:?}: {}", self.path, e),
        }
    }
}
