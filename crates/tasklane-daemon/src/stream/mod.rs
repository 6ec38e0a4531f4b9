//! Event stream reader: per-task NDJSON buffering, `LogEvent` decoding and
//! fan-out to subscribers.

pub mod hub;
pub mod reader;

pub use hub::{EventHub, EventHubHandle};
pub use reader::{StreamReader, SubscriberId, Subscription};
