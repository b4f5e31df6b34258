//! Durable console and metrics history as JSON files in the data directory.

use crate::console::{ConsoleHistory, ConsoleLine};
use crate::paths::Paths;
use crate::telemetry::{MetricSample, MetricsHistory};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
    console_path: PathBuf,
    metrics_path: PathBuf,
}

impl HistoryStore {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.data_dir().to_path_buf(),
            console_path: paths.console_history_file(),
            metrics_path: paths.metrics_history_file(),
        }
    }

    pub async fn load_console(&self, capacity: usize) -> ConsoleHistory {
        let lines: Vec<ConsoleLine> = load_or_empty(&self.console_path).await;
        ConsoleHistory::from_lines(capacity, lines)
    }

    pub async fn load_metrics(&self, capacity: usize) -> MetricsHistory {
        let samples: Vec<MetricSample> = load_or_empty(&self.metrics_path).await;
        MetricsHistory::from_samples(capacity, samples)
    }

    pub async fn save_console(&self, lines: &[ConsoleLine]) -> Result<(), StoreError> {
        self.write_json(&self.console_path, lines).await
    }

    pub async fn save_metrics(&self, samples: &[MetricSample]) -> Result<(), StoreError> {
        self.write_json(&self.metrics_path, samples).await
    }

    /// Write through a sibling temp file so a crash never leaves a torn file.
    async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(write_err)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(write_err)?;
        debug!(path = %path.display(), bytes = bytes.len(), "history written");
        Ok(())
    }
}

/// Missing files are empty history; unreadable or corrupt ones are logged
/// and treated the same way.
async fn load_or_empty<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read history, starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_slice(&content) {
        Ok(items) => items,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt history, starting empty");
            Vec::new()
        }
    }
}
