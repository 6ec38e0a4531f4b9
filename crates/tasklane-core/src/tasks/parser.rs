//! Task document parser.
//!
//! Tolerant reader: a malformed line produces a [`ParseWarning`] and is
//! skipped, it never stops the rest of the document from parsing.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use super::{Document, Group, Task, TaskId, TaskStatus};

#[allow(clippy::expect_used)]
static GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#{1,6}\s+(\S.*?)\s*$").expect("static regex is valid"));

#[allow(clippy::expect_used)]
static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*(?:[-*]\s+)?)\[([^\]]*)\](?:\s+(.*?))?\s*$").expect("static regex is valid")
});

#[allow(clippy::expect_used)]
static TAGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)\s*\{([^{}]*)\}$").expect("static regex is valid"));

/// A line that looked like a task but could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    /// 1-based line number.
    pub line: usize,
    pub message: String,
}

/// Decoded contents of a `[...]` status marker.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct Marker {
    pub status: TaskStatus,
    pub token: Option<String>,
    pub id: Option<TaskId>,
}

/// Byte range of the `[...]` marker within a task line, if the line is one.
pub(super) fn marker_span(line: &str) -> Option<std::ops::Range<usize>> {
    let caps = TASK_RE.captures(line)?;
    let prefix = caps.get(1)?;
    let inner = caps.get(2)?;
    Some(prefix.end()..inner.end() + 1)
}

/// Parse document text. Never fails; see [`Document::warnings`].
pub fn parse(text: &str) -> Document {
    let trailing_newline = text.ends_with('\n');
    let body = text.strip_suffix('\n').unwrap_or(text);
    let lines: Vec<String> = body.split('\n').map(String::from).collect();

    let mut groups: Vec<Group> = Vec::new();
    let mut warnings = Vec::new();
    let mut seen_ids: HashSet<TaskId> = HashSet::new();

    for (index, line) in lines.iter().enumerate() {
        if let Some(caps) = GROUP_RE.captures(line) {
            let name = caps.get(1).map_or("", |m| m.as_str()).to_string();
            groups.push(Group {
                name,
                tasks: Vec::new(),
            });
            continue;
        }

        let Some(caps) = TASK_RE.captures(line) else {
            continue;
        };
        let marker_text = caps.get(2).map_or("", |m| m.as_str());
        let body = caps.get(3).map_or("", |m| m.as_str());

        let mut marker = match parse_marker(marker_text) {
            Ok(marker) => marker,
            Err(message) => {
                warnings.push(ParseWarning {
                    line: index + 1,
                    message,
                });
                continue;
            }
        };

        let (description, tags) = split_tags(body);
        if description.is_empty() {
            warnings.push(ParseWarning {
                line: index + 1,
                message: "task has no description".to_string(),
            });
            continue;
        }

        if let Some(id) = &marker.id
            && !seen_ids.insert(id.clone())
        {
            warnings.push(ParseWarning {
                line: index + 1,
                message: format!("duplicate task id '{id}' ignored"),
            });
            marker.id = None;
        }

        if groups.is_empty() {
            groups.push(Group::default());
        }
        let group = groups.last_mut().map(|g| &mut g.tasks);
        if let Some(tasks) = group {
            let (external_ref, last_error) = match marker.status {
                TaskStatus::Done => (marker.token, None),
                TaskStatus::Failed => (None, marker.token),
                _ => (None, None),
            };
            tasks.push(Task {
                id: marker.id,
                description: description.to_string(),
                status: marker.status,
                tags,
                ordinal: tasks.len(),
                external_ref,
                last_error,
                line: index,
            });
        }
    }

    for warning in &warnings {
        warn!(line = warning.line, message = %warning.message, "Skipping task line");
    }

    Document {
        groups,
        warnings,
        lines,
        trailing_newline,
    }
}

/// Parse the inside of a status marker: `<glyph>( <token>)?(, <id>)?`.
pub(super) fn parse_marker(text: &str) -> Result<Marker, String> {
    let (head, id) = match text.split_once(',') {
        Some((head, id)) => {
            let id = id.trim();
            (head.trim(), (!id.is_empty()).then(|| TaskId::from(id)))
        }
        None => (text.trim(), None),
    };

    if head.is_empty() {
        return Ok(Marker {
            status: TaskStatus::Pending,
            token: None,
            id,
        });
    }

    let mut chars = head.chars();
    let glyph = chars.next().unwrap_or_default();
    let rest = chars.as_str();
    // Some glyphs are followed by a variation selector (U+FE0F).
    let rest = rest.strip_prefix('\u{FE0F}').unwrap_or(rest);
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return Err(format!("unrecognised status marker '[{text}]'"));
    }
    let token = Some(rest.trim())
        .filter(|t| !t.is_empty())
        .map(String::from);

    let status = match glyph {
        '⏰' => TaskStatus::Blocked,
        '⏳' | '🔄' | '▶' => TaskStatus::InProgress,
        '✓' | '✔' | '✅' | 'x' | 'X' => TaskStatus::Done,
        '✗' | '✘' | '❌' => TaskStatus::Failed,
        _ => return Err(format!("unrecognised status marker '[{text}]'")),
    };

    if token.is_some() && !matches!(status, TaskStatus::Done | TaskStatus::Failed) {
        return Err(format!("unexpected text in {status} marker '[{text}]'"));
    }

    Ok(Marker { status, token, id })
}

fn split_tags(body: &str) -> (&str, BTreeSet<String>) {
    let Some(caps) = TAGS_RE.captures(body) else {
        return (body.trim(), BTreeSet::new());
    };
    let description = caps.get(1).map_or("", |m| m.as_str()).trim();
    let tags = caps
        .get(2)
        .map_or("", |m| m.as_str())
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    (description, tags)
}
