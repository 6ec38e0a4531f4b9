//! Tolerant reader for agent records: unknown fields ignored, unknown types
//! surfaced as [`AgentRecord::Unknown`].

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line of agent stdout.
pub fn parse_line(line: &str) -> Result<AgentRecord> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into an agent record.
pub fn parse_value(raw: &Value) -> Result<AgentRecord> {
    let record_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    let record = match record_type {
        "system" => AgentRecord::System {
            subtype: str_field(raw, "subtype").unwrap_or_default().to_string(),
        },
        "assistant" => parse_assistant(raw),
        "tool_use" => AgentRecord::ToolUse(parse_tool_call(raw.get("tool_use").unwrap_or(raw))),
        "user" => parse_user(raw),
        "tool_result" => AgentRecord::ToolResults(vec![parse_tool_result(raw)]),
        "stream_event" => AgentRecord::StreamEvent,
        "result" => parse_result(raw),
        "error" => parse_error(raw),
        other => AgentRecord::Unknown {
            record_type: other.to_string(),
        },
    };
    Ok(record)
}

fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

fn parse_assistant(raw: &Value) -> AgentRecord {
    let msg = raw.get("message").unwrap_or(raw);
    let content = match msg.get("content") {
        Some(Value::Array(blocks)) => blocks.iter().filter_map(parse_content_block).collect(),
        // Some agents send a bare string.
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        _ => Vec::new(),
    };
    AgentRecord::Assistant(AssistantMessage { content })
}

fn parse_content_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type")?.as_str()? {
        "text" => Some(ContentBlock::Text {
            text: str_field(block, "text")?.to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse(parse_tool_call(block))),
        _ => None,
    }
}

fn parse_tool_call(raw: &Value) -> ToolCall {
    ToolCall {
        id: str_field(raw, "id").unwrap_or_default().to_string(),
        name: str_field(raw, "name")
            .or_else(|| str_field(raw, "tool"))
            .unwrap_or("tool")
            .to_string(),
        input: raw.get("input").cloned().unwrap_or(Value::Null),
    }
}

fn parse_user(raw: &Value) -> AgentRecord {
    let msg = raw.get("message").unwrap_or(raw);
    let results = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| str_field(b, "type") == Some("tool_result"))
                .map(parse_tool_result)
                .collect()
        })
        .unwrap_or_default();
    AgentRecord::ToolResults(results)
}

fn parse_tool_result(block: &Value) -> ToolResult {
    ToolResult {
        tool_use_id: str_field(block, "tool_use_id")
            .unwrap_or_default()
            .to_string(),
        content: flatten_content(block.get("content")),
        is_error: block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// Tool result content is either a string or a list of `text` blocks.
fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| str_field(b, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_result(raw: &Value) -> AgentRecord {
    let subtype = match str_field(raw, "subtype") {
        Some("success") | None => ResultSubtype::Success,
        Some(s) if s.starts_with("error") => ResultSubtype::Error(s.to_string()),
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };
    AgentRecord::Result(RunResult {
        subtype,
        is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        result: str_field(raw, "result").map(String::from),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        num_turns: raw
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        cost_usd: raw
            .get("total_cost_usd")
            .or_else(|| raw.get("cost_usd"))
            .and_then(Value::as_f64),
    })
}

fn parse_error(raw: &Value) -> AgentRecord {
    let message = raw
        .get("error")
        .and_then(|e| str_field(e, "message").or_else(|| e.as_str()))
        .or_else(|| str_field(raw, "message"))
        .unwrap_or("unknown error")
        .to_string();
    AgentRecord::Error { message }
}
