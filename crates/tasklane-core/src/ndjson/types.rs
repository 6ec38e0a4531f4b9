//! Record types of the agent `stream-json` protocol.

use serde_json::Value;

/// One decoded line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentRecord {
    /// `system` records (session init, hooks, status).
    System { subtype: String },
    Assistant(AssistantMessage),
    /// A bare top-level `tool_use` record.
    ToolUse(ToolCall),
    /// Tool results, echoed through `user` or `tool_result` records.
    ToolResults(Vec<ToolResult>),
    /// Partial-message streaming events. Not summarised.
    StreamEvent,
    Result(RunResult),
    Error { message: String },
    Unknown { record_type: String },
}

/// Assistant message content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// Concatenated non-empty text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } if !text.trim().is_empty() => Some(text.trim()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse(call) => Some(call),
            ContentBlock::Text { .. } => None,
        })
    }
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse(ToolCall),
}

/// A tool invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Final `result` record of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub subtype: ResultSubtype,
    pub is_error: bool,
    /// Final answer text, when the agent reports one.
    pub result: Option<String>,
    pub duration_ms: u64,
    pub num_turns: u32,
    pub cost_usd: Option<f64>,
}

impl RunResult {
    pub fn failed(&self) -> bool {
        self.is_error || matches!(self.subtype, ResultSubtype::Error(_))
    }
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    /// `error` or any `error_*` subtype, e.g. `error_max_turns`.
    Error(String),
    Unknown(String),
}
