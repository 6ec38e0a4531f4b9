//! Summarised, observer-facing view of agent output.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use crate::ndjson::{AgentRecord, ToolCall};
use crate::tasks::TaskId;

/// Maximum summary length in characters, including the ellipsis.
pub const MAX_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    AssistantMessage,
    ToolInvocation,
    ToolResult,
    Completion,
    Error,
}

/// One meaningful step of a running task.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    /// Unix time in milliseconds.
    pub timestamp_ms: u64,
    pub source_task_id: TaskId,
    pub kind: LogEventKind,
    pub summary: String,
    /// The record as received, shared between subscribers.
    #[serde(skip)]
    pub raw: Arc<Value>,
}

impl LogEvent {
    /// Map a decoded record to an event. Structural records and records with
    /// nothing to show yield `None`.
    pub fn from_record(task_id: &TaskId, record: &AgentRecord, raw: Arc<Value>) -> Option<Self> {
        let (kind, text) = match record {
            AgentRecord::Assistant(msg) => {
                let text = msg.text();
                if text.is_empty() {
                    let calls: Vec<_> = msg.tool_calls().map(describe_tool_call).collect();
                    if calls.is_empty() {
                        return None;
                    }
                    (LogEventKind::ToolInvocation, calls.join("; "))
                } else {
                    (LogEventKind::AssistantMessage, text)
                }
            }
            AgentRecord::ToolUse(call) => (LogEventKind::ToolInvocation, describe_tool_call(call)),
            AgentRecord::ToolResults(results) => {
                let first = results.first()?;
                let text = if first.is_error {
                    format!("error: {}", first.content)
                } else if first.content.trim().is_empty() {
                    "(no output)".to_string()
                } else {
                    first.content.clone()
                };
                (LogEventKind::ToolResult, text)
            }
            AgentRecord::Result(result) => {
                let status = if result.failed() { "failed" } else { "completed" };
                let mut text = format!("{status} in {} turns", result.num_turns);
                if let Some(answer) = result.result.as_deref().filter(|a| !a.trim().is_empty()) {
                    text.push_str(": ");
                    text.push_str(answer);
                }
                (LogEventKind::Completion, text)
            }
            AgentRecord::Error { message } => (LogEventKind::Error, message.clone()),
            AgentRecord::System { .. } | AgentRecord::StreamEvent | AgentRecord::Unknown { .. } => {
                return None;
            }
        };
        Some(Self {
            timestamp_ms: unix_timestamp_ms(),
            source_task_id: task_id.clone(),
            kind,
            summary: summarize(&text),
            raw,
        })
    }
}

/// `Name: <first input value>` for a tool call.
fn describe_tool_call(call: &ToolCall) -> String {
    let detail = match &call.input {
        Value::Object(map) => map.values().find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }),
        Value::String(s) => Some(s.clone()),
        _ => None,
    };
    match detail {
        Some(d) if !d.is_empty() => format!("{}: {d}", call.name),
        _ => call.name.clone(),
    }
}

/// Collapse whitespace runs (including newlines) and bound the length.
pub fn summarize(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_SUMMARY_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(MAX_SUMMARY_CHARS - 1).collect();
    cut.push('…');
    cut
}

pub fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ndjson::parse_value;
    use serde_json::json;

    fn event(raw: &Value) -> Option<LogEvent> {
        let record = parse_value(raw).unwrap();
        LogEvent::from_record(&TaskId::from("id1"), &record, Arc::new(raw.clone()))
    }

    #[test]
    fn assistant_text_becomes_message() {
        let ev = event(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "Line one\n\nline two"}]}
        }))
        .unwrap();
        assert_eq!(ev.kind, LogEventKind::AssistantMessage);
        assert_eq!(ev.summary, "Line one line two");
        assert_eq!(ev.source_task_id.as_str(), "id1");
    }

    #[test]
    fn assistant_tool_use_only_becomes_invocation() {
        let ev = event(&json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "id": "t", "name": "Bash", "input": {"command": "cargo fmt"}}]}
        }))
        .unwrap();
        assert_eq!(ev.kind, LogEventKind::ToolInvocation);
        assert_eq!(ev.summary, "Bash: cargo fmt");
    }

    #[test]
    fn empty_assistant_is_discarded() {
        assert!(event(&json!({"type": "assistant", "message": {"content": []}})).is_none());
    }

    #[test]
    fn structural_records_are_discarded() {
        assert!(event(&json!({"type": "system", "subtype": "init"})).is_none());
        assert!(event(&json!({"type": "stream_event", "event": {}})).is_none());
        assert!(event(&json!({"type": "brand_new"})).is_none());
    }

    #[test]
    fn tool_result_error_is_marked() {
        let ev = event(&json!({"type": "tool_result", "tool_use_id": "t", "content": "denied", "is_error": true})).unwrap();
        assert_eq!(ev.kind, LogEventKind::ToolResult);
        assert_eq!(ev.summary, "error: denied");
    }

    #[test]
    fn result_becomes_completion() {
        let ev = event(&json!({"type": "result", "subtype": "success", "num_turns": 3, "result": "All good"})).unwrap();
        assert_eq!(ev.kind, LogEventKind::Completion);
        assert_eq!(ev.summary, "completed in 3 turns: All good");
    }

    #[test]
    fn error_record_becomes_error() {
        let ev = event(&json!({"type": "error", "error": {"message": "overloaded"}})).unwrap();
        assert_eq!(ev.kind, LogEventKind::Error);
        assert_eq!(ev.summary, "overloaded");
    }

    #[test]
    fn summary_is_bounded() {
        let long = "word ".repeat(100);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), MAX_SUMMARY_CHARS);
        assert!(summary.ends_with('…'));
        assert_eq!(summarize("short"), "short");
    }

    #[test]
    fn raw_payload_is_kept() {
        let raw = json!({"type": "error", "message": "x", "extra": 42});
        let ev = event(&raw).unwrap();
        assert_eq!(ev.raw["extra"], 42);
    }
}
