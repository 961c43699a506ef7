//! Local experiment-tracking sink: one JSON object per line.

use crate::error::{TrainResult, TrainingError};
use crate::results::ResultRecord;
use crate::trainer::{EpochMetrics, EpochObserver};
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct JsonlTracker {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTracker {
    /// Open (append) `path`, creating parent directories.
    pub fn create(path: &Path) -> TrainResult<Self> {
        let io_err = |source| TrainingError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        tracing::info!("tracking run in {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &str, payload: serde_json::Value) -> TrainResult<()> {
        let line = json!({
            "event": event,
            "time": chrono::Utc::now().to_rfc3339(),
            "data": payload,
        });
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|source| TrainingError::Io {
                path: self.path.clone(),
                source,
            })
    }

    pub fn log_config(&mut self, config: serde_json::Value) -> TrainResult<()> {
        self.write_event("config", config)
    }

    pub fn log_summary(&mut self, name: &str, summary: serde_json::Value) -> TrainResult<()> {
        self.write_event(name, summary)
    }

    pub fn log_result(&mut self, record: &ResultRecord) -> TrainResult<()> {
        self.write_event("result", record.to_json())
    }
}

impl EpochObserver for JsonlTracker {
    fn on_epoch(&mut self, metrics: &EpochMetrics) -> TrainResult<()> {
        let payload = serde_json::to_value(metrics)?;
        self.write_event("epoch", payload)
    }
}
