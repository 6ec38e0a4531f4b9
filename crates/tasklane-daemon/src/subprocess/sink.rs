//! Append-only per-task output files.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use tasklane_core::TaskId;

/// `<log_dir>/<task_id>.ndjson`, written through as output arrives.
#[derive(Debug)]
pub struct TaskSink {
    path: PathBuf,
    file: File,
}

impl TaskSink {
    pub fn path_for(log_dir: &Path, task_id: &TaskId) -> PathBuf {
        log_dir.join(format!("{task_id}.ndjson"))
    }

    /// Open (creating the directory if needed) in append mode.
    pub async fn open(log_dir: &Path, task_id: &TaskId) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;
        let path = Self::path_for(log_dir, task_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one chunk and flush it.
    pub async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.file.flush().await
    }
}
