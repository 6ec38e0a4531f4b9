//! Incremental NDJSON decoding and subscriber fan-out.
//!
//! Output arrives in arbitrary chunks. Each task keeps its own byte buffer;
//! only newline-terminated records are decoded and the tail waits for the
//! next chunk.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tasklane_core::ndjson::parse_value;
use tasklane_core::{LogEvent, TaskId};

/// Largest unterminated record kept per task.
pub const MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Task(TaskId),
    All,
}

impl Subscription {
    fn matches(&self, task_id: &TaskId) -> bool {
        match self {
            Self::Task(id) => id == task_id,
            Self::All => true,
        }
    }
}

struct Subscriber {
    id: SubscriberId,
    filter: Subscription,
    tx: mpsc::UnboundedSender<LogEvent>,
}

/// Buffers, decoder and subscriber table.
#[derive(Default)]
pub struct StreamReader {
    buffers: HashMap<TaskId, Vec<u8>>,
    subscribers: Vec<Subscriber>,
}

impl StreamReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw output.
    pub fn on_data(&mut self, task_id: &TaskId, chunk: &[u8]) {
        let buffer = self.buffers.entry(task_id.clone()).or_default();
        let carried = buffer.len();
        buffer.extend_from_slice(chunk);
        let records = take_records(buffer, carried);

        if buffer.len() > MAX_BUFFERED_BYTES {
            warn!(
                task_id = %task_id,
                bytes = buffer.len(),
                "Discarding oversized unterminated record"
            );
            buffer.clear();
        }

        for record in records {
            self.decode(task_id, &record);
        }
    }

    /// End of stream: decode a final unterminated record if it is complete.
    pub fn finish(&mut self, task_id: &TaskId) {
        let Some(rest) = self.buffers.remove(task_id) else {
            return;
        };
        if rest.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match std::str::from_utf8(&rest)
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(s.trim()).ok())
        {
            Some(raw) => self.on_record(task_id, raw),
            None => debug!(task_id = %task_id, bytes = rest.len(), "Dropping partial trailing record"),
        }
    }

    /// Feed a record that was already decoded upstream.
    pub fn on_record(&mut self, task_id: &TaskId, raw: Value) {
        let record = match parse_value(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Dropping undecodable record");
                return;
            }
        };
        if let Some(event) = LogEvent::from_record(task_id, &record, Arc::new(raw)) {
            self.publish(&event);
        }
    }

    pub fn subscribe(
        &mut self,
        filter: Subscription,
        tx: mpsc::UnboundedSender<LogEvent>,
    ) -> SubscriberId {
        let id = SubscriberId::next();
        self.add_subscriber(id, filter, tx);
        id
    }

    pub(crate) fn add_subscriber(
        &mut self,
        id: SubscriberId,
        filter: Subscription,
        tx: mpsc::UnboundedSender<LogEvent>,
    ) {
        debug!(?id, ?filter, "Subscriber added");
        self.subscribers.push(Subscriber { id, filter, tx });
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn decode(&mut self, task_id: &TaskId, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            warn!(task_id = %task_id, bytes = line.len(), "Dropping non-UTF-8 record");
            return;
        };
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(raw) => self.on_record(task_id, raw),
            Err(e) => warn!(task_id = %task_id, error = %e, "Dropping malformed record"),
        }
    }

    fn publish(&mut self, event: &LogEvent) {
        self.subscribers.retain(|sub| {
            if !sub.filter.matches(&event.source_task_id) {
                return !sub.tx.is_closed();
            }
            if sub.tx.send(event.clone()).is_err() {
                debug!(id = ?sub.id, "Removing closed subscriber");
                return false;
            }
            true
        });
    }
}

/// Split complete lines off the front of `buffer`.
///
/// The first `carried` bytes hold no newline (they are the unterminated tail
/// of earlier chunks), so the search starts after them.
fn take_records(buffer: &mut Vec<u8>, carried: usize) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut start = 0;
    let mut from = carried;
    while let Some(pos) = buffer[from..].iter().position(|&b| b == b'\n') {
        let end = from + pos;
        records.push(buffer[start..end].to_vec());
        start = end + 1;
        from = start;
    }
    buffer.drain(..start);
    records
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tasklane_core::LogEventKind;

    const TEXT: &str = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","num_turns":1}"#;

    fn drain(rx: &mut mpsc::UnboundedReceiver<LogEvent>) -> Vec<LogEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn split_record_is_decoded_once_complete() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, tx);
        let id = TaskId::from("id1");

        let line = format!("{TEXT}\n");
        let (a, b) = line.split_at(17);
        reader.on_data(&id, a.as_bytes());
        assert!(drain(&mut rx).is_empty());
        reader.on_data(&id, b.as_bytes());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LogEventKind::AssistantMessage);
        assert_eq!(events[0].summary, "hello");
    }

    #[test]
    fn several_records_in_one_chunk_keep_order() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, tx);
        let id = TaskId::from("id1");

        reader.on_data(&id, format!("{TEXT}\n{RESULT}\n").as_bytes());
        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![LogEventKind::AssistantMessage, LogEventKind::Completion]
        );
    }

    #[test]
    fn malformed_record_does_not_stop_stream() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, tx);
        let id = TaskId::from("id1");

        reader.on_data(&id, b"{not json\n\xff\xfe\n");
        reader.on_data(&id, format!("{RESULT}\n").as_bytes());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn finish_decodes_complete_tail_and_drops_partial() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, tx);

        let complete = TaskId::from("id1");
        reader.on_data(&complete, RESULT.as_bytes());
        reader.finish(&complete);
        assert_eq!(drain(&mut rx).len(), 1);

        let partial = TaskId::from("id2");
        reader.on_data(&partial, &RESULT.as_bytes()[..10]);
        reader.finish(&partial);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn task_filter_and_wildcard() {
        let mut reader = StreamReader::new();
        let (one_tx, mut one_rx) = mpsc::unbounded_channel();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::Task(TaskId::from("id1")), one_tx);
        reader.subscribe(Subscription::All, all_tx);

        reader.on_data(&TaskId::from("id1"), format!("{TEXT}\n").as_bytes());
        reader.on_data(&TaskId::from("id2"), format!("{TEXT}\n").as_bytes());

        assert_eq!(drain(&mut one_rx).len(), 1);
        let all = drain(&mut all_rx);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].source_task_id.as_str(), "id2");
    }

    #[test]
    fn closed_subscriber_is_removed_without_affecting_others() {
        let mut reader = StreamReader::new();
        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, gone_tx);
        reader.subscribe(Subscription::All, tx);
        drop(gone_rx);

        reader.on_data(&TaskId::from("id1"), format!("{TEXT}\n").as_bytes());
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(reader.subscriber_count(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = reader.subscribe(Subscription::All, tx);
        assert!(reader.unsubscribe(id));
        assert!(!reader.unsubscribe(id));

        reader.on_data(&TaskId::from("id1"), format!("{TEXT}\n").as_bytes());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn structural_records_produce_no_events() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, tx);
        reader.on_data(
            &TaskId::from("id1"),
            b"{\"type\":\"system\",\"subtype\":\"init\"}\n{\"type\":\"stream_event\"}\n",
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn oversized_tail_is_discarded() {
        let mut reader = StreamReader::new();
        let id = TaskId::from("id1");
        reader.on_data(&id, &vec![b'a'; MAX_BUFFERED_BYTES + 1]);
        assert!(reader.buffers.get(&id).is_none_or(Vec::is_empty));
    }

    #[test]
    fn record_fed_byte_by_byte_is_decoded_once() {
        let mut reader = StreamReader::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.subscribe(Subscription::All, tx);
        let id = TaskId::from("id1");

        let stream = format!("{TEXT}\n{RESULT}");
        for byte in stream.as_bytes() {
            reader.on_data(&id, std::slice::from_ref(byte));
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].summary, "hello");
        assert_eq!(reader.buffers[&id], RESULT.as_bytes());
    }

    #[test]
    fn carried_tail_joins_the_next_line() {
        let mut buffer = b"abc".to_vec();
        buffer.extend_from_slice(b"def\nghi\n\njk");
        let records = take_records(&mut buffer, 3);
        assert_eq!(records, vec![b"abcdef".to_vec(), b"ghi".to_vec(), Vec::new()]);
        assert_eq!(buffer, b"jk");
    }
}
