//! tasklane daemon library
//!
//! Core functionality for the tasklane daemon:
//! - Agent process supervision with a concurrency ceiling
//! - Companion orchestrator link with direct-launch fallback
//! - Incremental decoding of agent output into log events
//! - Reconciliation of the Markdown task document

pub mod orchestration;
pub mod stream;
pub mod subprocess;
pub mod watch;
