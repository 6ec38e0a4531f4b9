//! NDJSON decoding for the agent's `stream-json` output.
//!
//! Each line of agent stdout is one JSON record. Decoding is tolerant:
//! unknown fields are ignored and unknown record types become
//! [`AgentRecord::Unknown`] instead of an error.

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
