//! `tasklane` Core Library
//!
//! Shared functionality for the `tasklane` scheduler:
//! - Task document model, parser, writer and atomic file storage
//! - Eligibility resolution with per-group ordinal barriers
//! - NDJSON decoding of agent `stream-json` output and `LogEvent` summaries
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod eligibility;
pub mod error;
pub mod log_event;
pub mod ndjson;
pub mod tasks;
pub mod tracing_init;

pub use config::Config;
pub use eligibility::{EligibleTask, eligible};
pub use error::{Error, Result};
pub use log_event::{LogEvent, LogEventKind};
pub use tasks::{Document, Task, TaskFile, TaskId, TaskLocator, TaskStatus, TaskUpdate};
