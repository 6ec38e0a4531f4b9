//! Types shared by the supervisor, its companion link and the process monitors.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tasklane_core::TaskId;

/// How agent processes are being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Through the companion orchestrator.
    Primary,
    /// One directly spawned agent process per task.
    Fallback,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        })
    }
}

/// Terminal result of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Non-zero exit or killed by a signal.
    Failure { message: String },
    /// Wall-clock budget elapsed.
    Timeout { after: Duration },
    Cancelled,
    /// Work lost to a mode switch or daemon shutdown.
    Interrupted { reason: String },
}

impl ExitOutcome {
    /// Map a process exit code (`None` when killed by a signal).
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::Success,
            Some(code) => Self::Failure {
                message: format!("exited with code {code}"),
            },
            None => Self::Failure {
                message: "terminated by signal".to_string(),
            },
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Short text stored as the task's last error.
    pub fn error_text(&self) -> Option<String> {
        match self {
            Self::Success => None,
            Self::Failure { message } => Some(message.clone()),
            Self::Timeout { after } => Some(format!("timed out after {}s", after.as_secs())),
            Self::Cancelled => Some("cancelled".to_string()),
            Self::Interrupted { reason } => Some(format!("interrupted: {reason}")),
        }
    }
}

/// Returned by a successful spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRef {
    pub task_id: TaskId,
    pub serial: u64,
    pub mode: ExecutionMode,
    /// OS pid of the agent, when it was spawned directly.
    pub pid: Option<u32>,
}

/// Per-task launch parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub model: String,
    pub timeout: Option<Duration>,
    pub working_directory: Option<PathBuf>,
}

/// Messages from process monitors back to the supervisor.
#[derive(Debug)]
pub(crate) enum Completion {
    /// An agent run ended. `serial` is `None` for runs reported by the
    /// companion, which does not know spawn serials.
    Exited {
        task_id: TaskId,
        serial: Option<u64>,
        outcome: ExitOutcome,
    },
    /// The companion process itself exited.
    CompanionExited { code: Option<i32> },
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Concurrency limit reached ({live}/{max})")]
    CapacityReached { live: usize, max: usize },

    #[error("Task {task_id} is already running")]
    AlreadyRunning { task_id: TaskId },

    #[error("Failed to launch agent for task {task_id}: {reason}")]
    SpawnFailed { task_id: TaskId, reason: String },

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}
