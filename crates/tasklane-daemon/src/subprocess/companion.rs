//! Link to the companion orchestrator used in primary mode.
//!
//! Control messages go to the companion's stdin as NDJSON:
//!
//! ```text
//! {"op":"start","task_id":"id3","prompt":"…","model":"sonnet"}
//! {"op":"stop","task_id":"id3"}
//! {"op":"shutdown"}
//! ```
//!
//! Its stdout carries one JSON object per line, either an agent record for a
//! task (`{"task_id":"id3","record":{…}}`) or the end of a run
//! (`{"task_id":"id3","exit_code":0}`, `null` when the agent was killed).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tasklane_core::TaskId;

use super::command::companion_command;
use super::signal::{GRACE_PERIOD, shutdown_child};
use super::sink::TaskSink;
use super::types::{Completion, ExitOutcome};
use crate::stream::EventHubHandle;

/// Control message sent to the companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    Start {
        task_id: TaskId,
        prompt: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
    },
    Stop {
        task_id: TaskId,
    },
    Shutdown,
}

/// One line of companion output.
#[derive(Debug, Clone, PartialEq)]
pub enum CompanionEvent {
    Record { task_id: TaskId, record: Value },
    Exit { task_id: TaskId, exit_code: Option<i32> },
}

/// Decode a companion stdout line. Returns `None` for anything unrecognised.
pub fn decode_event(line: &str) -> Option<CompanionEvent> {
    let value: Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;
    let task_id = TaskId::from(obj.get("task_id")?.as_str()?);
    if let Some(record) = obj.get("record") {
        return Some(CompanionEvent::Record {
            task_id,
            record: record.clone(),
        });
    }
    let exit = obj.get("exit_code")?;
    let exit_code = match exit {
        Value::Null => None,
        other => Some(i32::try_from(other.as_i64()?).ok()?),
    };
    Some(CompanionEvent::Exit { task_id, exit_code })
}

/// Errors from the companion link. Any of them moves the supervisor to
/// fallback mode.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("Failed to launch companion: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Companion exited during startup (code {code:?})")]
    ExitedDuringProbe { code: Option<i32> },

    #[error("Companion {0} was not captured")]
    MissingPipe(&'static str),

    #[error("Companion control channel is closed")]
    ChannelClosed,
}

/// Where companion output goes.
pub(crate) struct CompanionContext {
    pub log_dir: PathBuf,
    pub hub: EventHubHandle,
    pub completions: mpsc::UnboundedSender<Completion>,
}

/// A running companion process.
pub struct CompanionHandle {
    pid: Option<u32>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl CompanionHandle {
    /// Launch the companion and wait out the startup probe.
    pub(crate) async fn launch(
        binary: &Path,
        args: &[String],
        agent_binary: &Path,
        probe: Duration,
        ctx: CompanionContext,
    ) -> Result<Self, CompanionError> {
        let mut child = companion_command(binary, args, agent_binary)
            .spawn()
            .map_err(CompanionError::Launch)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(CompanionError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(CompanionError::MissingPipe("stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(companion_pid = pid, "companion stderr: {}", line);
                }
            });
        }

        let pump = tokio::spawn(pump_stdout(
            stdout,
            ctx.log_dir,
            ctx.hub,
            ctx.completions.clone(),
        ));

        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                return Err(CompanionError::ExitedDuringProbe { code });
            }
            () = tokio::time::sleep(probe) => {}
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_control(stdin, control_rx));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let completions = ctx.completions;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = stop_rx => {
                    shutdown_child(&mut child, GRACE_PERIOD).await;
                    None
                }
            };
            // Deliver the runs the companion reported before its exit.
            let _ = pump.await;
            let code = status.and_then(|s| s.code());
            debug!(companion_pid = pid, ?code, "Companion exited");
            let _ = completions.send(Completion::CompanionExited { code });
        });

        info!(companion_pid = pid, binary = %binary.display(), "Companion started");
        Ok(Self {
            pid,
            control_tx,
            stop_tx: Some(stop_tx),
        })
    }

    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn send(&self, cmd: ControlCommand) -> Result<(), CompanionError> {
        self.control_tx
            .send(cmd)
            .map_err(|_| CompanionError::ChannelClosed)
    }

    /// Stop the companion process (SIGTERM, grace, SIGKILL).
    pub fn teardown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for CompanionHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn write_control(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<ControlCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut line = match serde_json::to_string(&cmd) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode control message");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write to companion stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "Failed to flush companion stdin");
            break;
        }
    }
    debug!("Companion control writer finished");
}

async fn pump_stdout(
    stdout: ChildStdout,
    log_dir: PathBuf,
    hub: EventHubHandle,
    completions: mpsc::UnboundedSender<Completion>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut sinks: HashMap<TaskId, TaskSink> = HashMap::new();

    while let Ok(Some(line)) = lines.next_line().await {
        match decode_event(&line) {
            Some(CompanionEvent::Record { task_id, record }) => {
                if !sinks.contains_key(&task_id) {
                    match TaskSink::open(&log_dir, &task_id).await {
                        Ok(sink) => {
                            sinks.insert(task_id.clone(), sink);
                        }
                        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to open task sink"),
                    }
                }
                if let Some(sink) = sinks.get_mut(&task_id) {
                    let mut bytes = record.to_string();
                    bytes.push('\n');
                    if let Err(e) = sink.write(bytes.as_bytes()).await {
                        warn!(task_id = %task_id, error = %e, "Failed to write task sink");
                    }
                }
                hub.on_record(&task_id, record);
            }
            Some(CompanionEvent::Exit { task_id, exit_code }) => {
                sinks.remove(&task_id);
                hub.finish(&task_id);
                let _ = completions.send(Completion::Exited {
                    task_id,
                    serial: None,
                    outcome: ExitOutcome::from_exit_code(exit_code),
                });
            }
            None => warn!(line = %line, "Ignoring unrecognised companion output"),
        }
    }
    debug!("Companion stdout closed");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn control_commands_serialize_with_op_tag() {
        let start = ControlCommand::Start {
            task_id: TaskId::from("id3"),
            prompt: "Write docs".into(),
            model: "sonnet".into(),
            working_directory: None,
        };
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            serde_json::json!({"op": "start", "task_id": "id3", "prompt": "Write docs", "model": "sonnet"})
        );
        assert_eq!(
            serde_json::to_string(&ControlCommand::Shutdown).unwrap(),
            r#"{"op":"shutdown"}"#
        );
        assert_eq!(
            serde_json::to_string(&ControlCommand::Stop {
                task_id: "id1".into()
            })
            .unwrap(),
            r#"{"op":"stop","task_id":"id1"}"#
        );
    }

    #[test]
    fn decode_record_and_exit_lines() {
        let record = decode_event(r#"{"task_id":"id2","record":{"type":"system"}}"#).unwrap();
        assert!(matches!(record, CompanionEvent::Record { ref task_id, .. } if task_id.as_str() == "id2"));

        assert_eq!(
            decode_event(r#"{"task_id":"id2","exit_code":3}"#),
            Some(CompanionEvent::Exit {
                task_id: "id2".into(),
                exit_code: Some(3)
            })
        );
        assert_eq!(
            decode_event(r#"{"task_id":"id2","exit_code":null}"#),
            Some(CompanionEvent::Exit {
                task_id: "id2".into(),
                exit_code: None
            })
        );
    }

    #[test]
    fn decode_rejects_unrecognised_lines() {
        assert!(decode_event("not json").is_none());
        assert!(decode_event(r#"{"task_id":"id1"}"#).is_none());
        assert!(decode_event(r#"{"record":{}}"#).is_none());
        assert!(decode_event(r#"{"task_id":"id1","exit_code":"zero"}"#).is_none());
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let (hub, _task) = crate::stream::EventHub::spawn();
        let (tx, _rx) = mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let result = CompanionHandle::launch(
            &dir.path().join("missing-companion"),
            &[],
            Path::new("claude"),
            Duration::from_millis(50),
            CompanionContext {
                log_dir: dir.path().to_path_buf(),
                hub,
                completions: tx,
            },
        )
        .await;
        assert!(matches!(result, Err(CompanionError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_fails_probe() {
        let (hub, _task) = crate::stream::EventHub::spawn();
        let (tx, _rx) = mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let result = CompanionHandle::launch(
            Path::new("sh"),
            &["-c".to_string(), "exit 4".to_string()],
            Path::new("claude"),
            Duration::from_secs(5),
            CompanionContext {
                log_dir: dir.path().to_path_buf(),
                hub,
                completions: tx,
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(CompanionError::ExitedDuringProbe { code: Some(4) })
        ));
    }
}
