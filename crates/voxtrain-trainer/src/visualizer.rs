//! JSONL scalar log.
//!
//! Every scalar is one line:
//!
//! ```json
//! {"tag": "train/generator_loss", "value": 1.25, "step": 100, "timestamp": "2024-12-31T12:00:00+00:00"}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxtrain_core::Observation;

use crate::error::Result;

/// File name used inside the experiment output directory.
pub const VISUALIZER_FILE: &str = "visualizer.jsonl";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Metric name.
    pub tag: String,
    /// Metric value.
    pub value: f64,
    /// Step the value belongs to.
    pub step: usize,
    /// RFC 3339 wall-clock time.
    pub timestamp: String,
}

/// Append-only scalar writer.
pub struct Visualizer {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Visualizer {
    /// Open `{dir}/visualizer.jsonl` for appending.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(VISUALIZER_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log one scalar.
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Log every entry of an observation at `step`.
    pub fn add_scalars(&mut self, observation: &Observation, step: usize) -> Result<()> {
        for (tag, value) in observation {
            self.add_scalar(tag, f64::from(*value), step)?;
        }
        Ok(())
    }

    /// Flush buffered records.
    pub fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for Visualizer {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Read every record of a visualizer file.
pub fn read_scalars(path: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}
