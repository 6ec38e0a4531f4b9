//! Status rewrites.

use tracing::debug;

use super::parser::marker_span;
use super::{Document, TaskId, TaskLocator, TaskStatus};
use crate::error::{Error, Result};

/// Longest error token stored in a `failed` marker, in characters.
const MAX_ERROR_CHARS: usize = 120;

/// A requested status change for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    /// Id to assign if the task does not have one yet.
    pub id: Option<TaskId>,
    /// Reference token for a `done` marker.
    pub reference: Option<String>,
    /// Error text for a `failed` marker.
    pub error: Option<String>,
}

impl TaskUpdate {
    pub const fn status(status: TaskStatus) -> Self {
        Self {
            status,
            id: None,
            reference: None,
            error: None,
        }
    }

    pub const fn started(id: TaskId) -> Self {
        Self {
            status: TaskStatus::InProgress,
            id: Some(id),
            reference: None,
            error: None,
        }
    }

    pub const fn succeeded() -> Self {
        Self::status(TaskStatus::Done)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            id: None,
            reference: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Render a status marker including its brackets.
pub fn render_marker(
    status: TaskStatus,
    token: Option<&str>,
    id: Option<&TaskId>,
) -> String {
    let glyph = match status {
        TaskStatus::Pending => "",
        TaskStatus::Blocked => "⏰",
        TaskStatus::InProgress => "⏳",
        TaskStatus::Done => "✓",
        TaskStatus::Failed => "✗",
    };
    let mut marker = String::from("[");
    marker.push_str(glyph);
    if let Some(token) = token.filter(|_| status.is_terminal()) {
        let token = sanitize_token(token);
        if !token.is_empty() {
            marker.push(' ');
            marker.push_str(&token);
        }
    }
    if let Some(id) = id {
        marker.push_str(", ");
        marker.push_str(id.as_str());
    }
    marker.push(']');
    marker
}

/// Apply `update` to the task `locator` points at.
///
/// Only the marker of that task's line changes; every other byte of the
/// document is preserved.
pub fn write(document: &Document, locator: &TaskLocator, update: &TaskUpdate) -> Result<Document> {
    let (_, task) = document
        .locate(locator)
        .ok_or_else(|| Error::TaskNotFound {
            group: locator.group.clone(),
            description: locator.description.clone(),
        })?;

    if !task.status.can_transition_to(update.status) {
        return Err(Error::InvalidTransition {
            from: task.status,
            to: update.status,
        });
    }

    let line_index = task.line;
    let id = task.id.clone().or_else(|| update.id.clone());
    let same_status = task.status == update.status;
    let (external_ref, last_error) = match update.status {
        TaskStatus::Done => (
            update
                .reference
                .clone()
                .or_else(|| task.external_ref.clone().filter(|_| same_status)),
            None,
        ),
        TaskStatus::Failed => (
            None,
            update
                .error
                .as_deref()
                .map(sanitize_token)
                .or_else(|| task.last_error.clone().filter(|_| same_status)),
        ),
        _ => (None, None),
    };

    let line = document.line(line_index).ok_or_else(|| Error::TaskNotFound {
        group: locator.group.clone(),
        description: locator.description.clone(),
    })?;
    let span = marker_span(line).ok_or_else(|| Error::TaskNotFound {
        group: locator.group.clone(),
        description: locator.description.clone(),
    })?;

    let token = external_ref.as_deref().or(last_error.as_deref());
    let marker = render_marker(update.status, token, id.as_ref());
    let mut rewritten = String::with_capacity(line.len() + marker.len());
    rewritten.push_str(&line[..span.start]);
    rewritten.push_str(&marker);
    rewritten.push_str(&line[span.end..]);

    debug!(
        line = line_index + 1,
        from = %task.status,
        to = %update.status,
        "Rewriting task marker"
    );

    let mut next = document.clone();
    next.set_line(line_index, rewritten);
    if let Some(task) = next.task_mut(line_index) {
        task.status = update.status;
        task.id = id;
        task.external_ref = external_ref;
        task.last_error = last_error;
    }
    Ok(next)
}

/// Make free text safe to embed in a marker and bound its length.
fn sanitize_token(text: &str) -> String {
    let flat: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .map(|c| match c {
            ',' => ';',
            ']' => ')',
            '[' => '(',
            other => other,
        })
        .collect();
    if flat.chars().count() <= MAX_ERROR_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX_ERROR_CHARS - 1).collect();
    cut.push('…');
    cut
}
