//! Single-owner task around [`StreamReader`].
//!
//! Output pumps and subscribers talk to the hub through an unbounded command
//! channel. Commands are applied in the order they were sent, so events of one
//! task reach subscribers in the order the agent produced them, and a pump
//! never waits on a slow subscriber.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use tasklane_core::{LogEvent, TaskId};

use super::reader::{StreamReader, SubscriberId, Subscription};

enum HubCommand {
    Data(TaskId, Vec<u8>),
    Record(TaskId, Value),
    Finish(TaskId),
    Subscribe(SubscriberId, Subscription, mpsc::UnboundedSender<LogEvent>),
    Unsubscribe(SubscriberId),
}

/// Owner of the event hub task.
pub struct EventHub;

impl EventHub {
    /// Start the hub. It runs until every handle has been dropped.
    pub fn spawn() -> (EventHubHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut reader = StreamReader::new();
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    HubCommand::Data(task_id, chunk) => reader.on_data(&task_id, &chunk),
                    HubCommand::Record(task_id, raw) => reader.on_record(&task_id, raw),
                    HubCommand::Finish(task_id) => reader.finish(&task_id),
                    HubCommand::Subscribe(id, filter, sink) => {
                        reader.add_subscriber(id, filter, sink);
                    }
                    HubCommand::Unsubscribe(id) => {
                        reader.unsubscribe(id);
                    }
                }
            }
            debug!("Event hub stopped");
        });
        (EventHubHandle { tx }, task)
    }
}

/// Cheap, cloneable access to the hub.
#[derive(Clone)]
pub struct EventHubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl EventHubHandle {
    pub fn on_data(&self, task_id: &TaskId, chunk: Vec<u8>) {
        self.send(HubCommand::Data(task_id.clone(), chunk));
    }

    pub fn on_record(&self, task_id: &TaskId, raw: Value) {
        self.send(HubCommand::Record(task_id.clone(), raw));
    }

    pub fn finish(&self, task_id: &TaskId) {
        self.send(HubCommand::Finish(task_id.clone()));
    }

    /// Receive events for one task, or for all tasks.
    pub fn subscribe(
        &self,
        filter: Subscription,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId::next();
        self.send(HubCommand::Subscribe(id, filter, tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.send(HubCommand::Unsubscribe(id));
    }

    fn send(&self, cmd: HubCommand) {
        if self.tx.send(cmd).is_err() {
            debug!("Event hub is gone; dropping command");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tasklane_core::LogEventKind;

    #[tokio::test]
    async fn hub_delivers_in_order_to_filtered_subscriber() {
        let (hub, task) = EventHub::spawn();
        let (_id, mut rx) = hub.subscribe(Subscription::Task(TaskId::from("id1")));

        let id1 = TaskId::from("id1");
        hub.on_data(&id1, b"{\"type\":\"error\",\"message\":\"first\"}\n{\"type\":\"er".to_vec());
        hub.on_data(&TaskId::from("id2"), b"{\"type\":\"error\",\"message\":\"other\"}\n".to_vec());
        hub.on_data(&id1, b"ror\",\"message\":\"second\"}".to_vec());
        hub.finish(&id1);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.summary, "first");
        assert_eq!(second.summary, "second");
        assert_eq!(second.kind, LogEventKind::Error);

        drop(hub);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn decoded_records_are_accepted() {
        let (hub, _task) = EventHub::spawn();
        let (_id, mut rx) = hub.subscribe(Subscription::All);
        hub.on_record(
            &TaskId::from("id7"),
            serde_json::json!({"type": "tool_use", "name": "Bash", "input": {"command": "ls"}}),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, LogEventKind::ToolInvocation);
        assert_eq!(event.summary, "Bash: ls");
    }

    #[tokio::test]
    async fn unsubscribed_receiver_is_closed() {
        let (hub, _task) = EventHub::spawn();
        let (id, mut rx) = hub.subscribe(Subscription::All);
        hub.unsubscribe(id);
        assert!(rx.recv().await.is_none());
    }
}
