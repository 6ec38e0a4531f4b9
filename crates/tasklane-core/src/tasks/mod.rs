//! Task document model, parser, writer and on-disk storage.
//!
//! A task document is a plain-text, line-oriented list of groups and tasks:
//!
//! ```text
//! ## backend
//! [✓, id1] Add the schema migration {db}
//! [⏳, id2] Wire the repository layer
//! [⏰] Expose the HTTP handlers {opus}
//! ```
//!
//! The parsed [`Document`] keeps every source line so that a status update
//! rewrites exactly one marker and leaves the rest of the text untouched.

mod parser;
mod store;
mod writer;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use parser::{ParseWarning, parse};
pub use store::TaskFile;
pub use writer::{TaskUpdate, render_marker, write};

/// Opaque, document-unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric suffix of ids of the form `id<N>`.
    fn sequence_number(&self) -> Option<u64> {
        self.0.strip_prefix("id")?.parse().ok()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    /// Whether the core may move a task from `self` to `next`.
    ///
    /// Rewriting the current status is allowed so that updates are
    /// idempotent, except for `InProgress`: a start must find the task
    /// startable. `Failed -> Pending` is the manual retry path.
    pub fn can_transition_to(self, next: Self) -> bool {
        (self == next && self != Self::InProgress)
            || matches!(
                (self, next),
                (Self::Pending | Self::Blocked, Self::InProgress)
                    | (Self::InProgress, Self::Done | Self::Failed)
                    | (Self::Failed, Self::Pending)
            )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Assigned when the task is first started.
    pub id: Option<TaskId>,
    pub description: String,
    pub status: TaskStatus,
    pub tags: BTreeSet<String>,
    /// Position within the owning group.
    pub ordinal: usize,
    /// Short reference token carried by a `done` marker.
    pub external_ref: Option<String>,
    /// Present only when `status == Failed`.
    pub last_error: Option<String>,
    /// 0-based index of the source line.
    pub line: usize,
}

/// An ordered, independent scope of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Group {
    pub name: String,
    pub tasks: Vec<Task>,
}

impl Group {
    /// Number of tasks in each status, in a stable order.
    pub fn status_counts(&self) -> [(TaskStatus, usize); 5] {
        let mut counts = [
            (TaskStatus::Pending, 0),
            (TaskStatus::Blocked, 0),
            (TaskStatus::InProgress, 0),
            (TaskStatus::Done, 0),
            (TaskStatus::Failed, 0),
        ];
        for task in &self.tasks {
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == task.status) {
                entry.1 += 1;
            }
        }
        counts
    }
}

/// Addresses a task inside a document.
///
/// The stored form is a rendering of fields rather than a keyed record, so
/// tasks are found by description within their group, starting at the
/// ordinal they were read at. A task carrying a different id is never
/// matched. The id alone is used when the description no longer matches
/// (edited by hand since the last read).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskLocator {
    pub group: String,
    pub description: String,
    pub id: Option<TaskId>,
    /// Position within the group when the task was read.
    pub ordinal: Option<usize>,
}

impl TaskLocator {
    pub fn of(group: &str, task: &Task) -> Self {
        Self {
            group: group.to_string(),
            description: task.description.clone(),
            id: task.id.clone(),
            ordinal: Some(task.ordinal),
        }
    }

    /// Address a task by id only.
    pub fn by_id(id: TaskId) -> Self {
        Self {
            group: String::new(),
            description: String::new(),
            id: Some(id),
            ordinal: None,
        }
    }

    fn admits(&self, task: &Task) -> bool {
        task.description == self.description
            && match (&self.id, &task.id) {
                (Some(want), Some(have)) => want == have,
                _ => true,
            }
    }

    #[must_use]
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }
}

/// Parsed task document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    pub groups: Vec<Group>,
    pub warnings: Vec<ParseWarning>,
    lines: Vec<String>,
    trailing_newline: bool,
}

impl Document {
    /// Re-serialize the whole document.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Iterate over `(group name, task)` in group order, then ordinal order.
    pub fn tasks(&self) -> impl Iterator<Item = (&str, &Task)> {
        self.groups
            .iter()
            .flat_map(|g| g.tasks.iter().map(move |t| (g.name.as_str(), t)))
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn task_by_id(&self, id: &TaskId) -> Option<(&str, &Task)> {
        self.tasks().find(|(_, t)| t.id.as_ref() == Some(id))
    }

    /// Find the task a locator points at.
    ///
    /// Within the group: the task at the locator's ordinal, then a task with
    /// the same description and id, then the first same-description task
    /// without a conflicting id. Outside it: the task with the locator's id.
    pub fn locate(&self, locator: &TaskLocator) -> Option<(&str, &Task)> {
        if let Some(group) = self.group(&locator.group) {
            let chosen = locator
                .ordinal
                .and_then(|i| group.tasks.get(i))
                .filter(|t| locator.admits(t))
                .or_else(|| {
                    let id = locator.id.as_ref()?;
                    group
                        .tasks
                        .iter()
                        .find(|t| t.id.as_ref() == Some(id) && locator.admits(t))
                })
                .or_else(|| group.tasks.iter().find(|t| locator.admits(t)));
            if let Some(task) = chosen {
                return Some((group.name.as_str(), task));
            }
        }
        locator.id.as_ref().and_then(|id| self.task_by_id(id))
    }

    /// Next free id of the form `id<N>`.
    pub fn next_task_id(&self) -> TaskId {
        let max = self
            .tasks()
            .filter_map(|(_, t)| t.id.as_ref().and_then(TaskId::sequence_number))
            .max()
            .unwrap_or(0);
        TaskId(format!("id{}", max + 1))
    }

    pub(crate) fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    pub(crate) fn set_line(&mut self, index: usize, text: String) {
        if let Some(line) = self.lines.get_mut(index) {
            *line = text;
        }
    }

    pub(crate) fn task_mut(&mut self, line: usize) -> Option<&mut Task> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.tasks.iter_mut())
            .find(|t| t.line == line)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_state_machine() {
        use TaskStatus::{Blocked, Done, Failed, InProgress, Pending};
        assert!(Pending.can_transition_to(InProgress));
        assert!(Blocked.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Done));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Done.can_transition_to(Done));
        assert!(!InProgress.can_transition_to(InProgress));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Done.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Failed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Blocked.can_transition_to(Pending));
    }

    #[test]
    fn next_task_id_skips_past_highest() {
        let doc = parse("## g\n[✓, id4] a\n[⏳, id2] b\n[✗, custom] c\n[] d\n");
        assert_eq!(doc.next_task_id(), TaskId::from("id5"));
    }

    #[test]
    fn next_task_id_starts_at_one() {
        let doc = parse("## g\n[] a\n");
        assert_eq!(doc.next_task_id(), TaskId::from("id1"));
    }

    #[test]
    fn locate_falls_back_to_id_when_description_changed() {
        let doc = parse("## g\n[⏳, id1] reworded by hand\n");
        let locator = TaskLocator {
            group: "g".into(),
            description: "original".into(),
            id: Some("id1".into()),
            ordinal: Some(0),
        };
        let (group, task) = doc.locate(&locator).unwrap();
        assert_eq!(group, "g");
        assert_eq!(task.description, "reworded by hand");
    }

    #[test]
    fn locate_prefers_matching_id_among_duplicates() {
        let doc = parse("## g\n[✓, id1] same\n[⏳, id2] same\n");
        let locator = TaskLocator {
            group: "g".into(),
            description: "same".into(),
            id: Some("id2".into()),
            ordinal: None,
        };
        let (_, task) = doc.locate(&locator).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn locate_uses_ordinal_among_duplicates() {
        let doc = parse("## g\n[⏳, id1] Run tests\n[] Run tests\n");
        let second = TaskLocator::of("g", &doc.groups[0].tasks[1]);
        let (_, task) = doc.locate(&second).unwrap();
        assert_eq!(task.ordinal, 1);

        // A stale ordinal still cannot select a task with another id.
        let shifted = TaskLocator {
            ordinal: Some(0),
            ..second.with_id("id2".into())
        };
        let (_, task) = doc.locate(&shifted).unwrap();
        assert_eq!(task.ordinal, 1);
        assert!(task.id.is_none());
    }

    #[test]
    fn locate_never_matches_a_conflicting_id() {
        let doc = parse("## g\n[✓, id1] Run tests\n");
        let locator = TaskLocator {
            group: "g".into(),
            description: "Run tests".into(),
            id: Some("id2".into()),
            ordinal: Some(0),
        };
        assert!(doc.locate(&locator).is_none());
    }

    #[test]
    fn status_counts_are_per_group() {
        let doc = parse("## a\n[] x\n[⏰] y\n[] w\n## b\n[✓] z\n");
        let counts = doc.groups[0].status_counts();
        assert_eq!(counts[0], (TaskStatus::Pending, 2));
        assert_eq!(counts[1], (TaskStatus::Blocked, 1));
        assert_eq!(counts[3], (TaskStatus::Done, 0));
        assert_eq!(doc.groups[1].status_counts()[3], (TaskStatus::Done, 1));
    }

    #[test]
    fn render_preserves_missing_trailing_newline() {
        let text = "## g\n[] a";
        assert_eq!(parse(text).render(), text);
    }
}
