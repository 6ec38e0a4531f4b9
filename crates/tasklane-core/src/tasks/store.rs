//! Atomic on-disk storage for a task document.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{Document, TaskLocator, TaskUpdate, parse, write};
use crate::error::{Error, Result};

/// A task document on disk.
///
/// Every update re-reads the file right before writing so that external edits
/// made since the last load are kept. Last writer wins.
#[derive(Debug, Clone)]
pub struct TaskFile {
    path: PathBuf,
}

impl TaskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Document> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(parse(&text))
    }

    /// Apply one status update and persist the result.
    pub fn update(&self, locator: &TaskLocator, update: &TaskUpdate) -> Result<Document> {
        let current = self.load()?;
        let next = write(&current, locator, update)?;
        self.save(&next)?;
        info!(
            path = %self.path.display(),
            group = %locator.group,
            description = %locator.description,
            status = %update.status,
            "Task status written"
        );
        Ok(next)
    }

    /// Replace the file contents atomically.
    ///
    /// The text goes to a temporary file in the same directory, which is
    /// synced and renamed over the target. The temporary file is removed if
    /// any step fails.
    pub fn save(&self, document: &Document) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(document.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        if let Ok(meta) = std::fs::metadata(&self.path) {
            // Keep the mode of the file being replaced.
            let _ = std::fs::set_permissions(tmp.path(), meta.permissions());
        }
        tmp.persist(&self.path)
            .map_err(|e| Error::Persist(e.error.to_string()))?;
        debug!(path = %self.path.display(), "Task file replaced");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tasks::{TaskId, TaskStatus};

    fn fixture(text: &str) -> (tempfile::TempDir, TaskFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.md");
        std::fs::write(&path, text).unwrap();
        (dir, TaskFile::new(path))
    }

    #[test]
    fn update_persists_and_returns_document() {
        let (_dir, file) = fixture("## g1\n[] Task 1\n[⏰] Task 2\n");
        let doc = file.load().unwrap();
        let (group, task) = doc.tasks().next().unwrap();
        let locator = TaskLocator::of(group, task);

        let next = file
            .update(&locator, &TaskUpdate::started(doc.next_task_id()))
            .unwrap();
        assert_eq!(next.groups[0].tasks[0].status, TaskStatus::InProgress);

        let on_disk = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(on_disk, "## g1\n[⏳, id1] Task 1\n[⏰] Task 2\n");
    }

    #[test]
    fn update_rereads_external_edits() {
        let (_dir, file) = fixture("## g\n[] a\n");
        let doc = file.load().unwrap();
        let locator = TaskLocator::of("g", &doc.groups[0].tasks[0]);

        std::fs::write(file.path(), "## g\n[] a\n[] added by hand\n").unwrap();
        file.update(&locator, &TaskUpdate::started(TaskId::from("id1")))
            .unwrap();

        let on_disk = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(on_disk, "## g\n[⏳, id1] a\n[] added by hand\n");
    }

    #[test]
    fn failed_update_leaves_file_and_directory_clean() {
        let (dir, file) = fixture("## g\n[] a\n");
        let doc = file.load().unwrap();
        let locator = TaskLocator::of("g", &doc.groups[0].tasks[0]);

        let err = file.update(&locator, &TaskUpdate::succeeded()).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "## g\n[] a\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = TaskFile::new(dir.path().join("absent.md"));
        assert!(matches!(file.load().unwrap_err(), Error::Io(_)));
    }
}
