//! Early reconciliation on task file edits.
//!
//! The parent directory is watched rather than the file itself: saves replace
//! the file by rename, which would orphan a watch on the old inode. Events are
//! filtered by file name and coalesced into a single pending wake-up.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Keeps the OS watch alive. Dropping it stops the wake-ups.
pub struct TaskFileWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl TaskFileWatcher {
    /// Watch `task_file`. The receiver yields once per burst of changes.
    pub fn start(task_file: &Path) -> notify::Result<(Self, mpsc::Receiver<()>)> {
        let file_name = task_file
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| notify::Error::path_not_found().add_path(task_file.to_path_buf()))?;
        let dir = match task_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel(1);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        // A full channel already holds a pending wake-up.
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => warn!(error = %e, "Task file watch error"),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!(path = %task_file.display(), "Watching task file");
        Ok((
            Self {
                path: task_file.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskFileWatcher {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Task file watch stopped");
    }
}
