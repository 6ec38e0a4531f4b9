//! Agent process supervisor.
//!
//! [`Supervisor`] is the single owner of the live-process table and the
//! concurrency pool. It:
//! - launches one agent per task, through the companion (primary mode) or
//!   directly (fallback mode)
//! - enforces per-task timeouts (SIGTERM -> 5 s grace -> SIGKILL)
//! - cancels running tasks by signalling their process group
//! - reports every run exactly once through [`Supervisor::reconcile`]
//!
//! Monitors report back through a completion channel; nothing outside the
//! supervisor mutates its state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use tasklane_core::TaskId;
use tasklane_core::config::{AgentConfig, CompanionConfig, Config};

use super::command::agent_command;
use super::companion::{CompanionContext, CompanionHandle, ControlCommand};
use super::pool::{ConcurrencyPool, PoolError, PoolPermit};
use super::signal::{GRACE_PERIOD, shutdown_child, terminate_group};
use super::sink::TaskSink;
use super::types::{
    Completion, ExecutionMode, ExitOutcome, ProcessRef, SpawnOptions, SupervisorError,
};
use crate::stream::EventHubHandle;

/// Read size for agent stdout.
const CHUNK_SIZE: usize = 8 * 1024;

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub agent: AgentConfig,
    pub companion: CompanionConfig,
    pub max_concurrent: usize,
    pub log_dir: PathBuf,
    /// Time between SIGTERM and SIGKILL when a run times out.
    pub grace_period: Duration,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config, log_dir: PathBuf) -> Self {
        Self {
            agent: config.agent.clone(),
            companion: config.companion.clone(),
            max_concurrent: config.scheduler.max_concurrent,
            log_dir,
            grace_period: GRACE_PERIOD,
        }
    }
}

/// Runtime record of one live agent run.
struct AgentProcess {
    serial: u64,
    mode: ExecutionMode,
    pid: Option<u32>,
    started_at: Instant,
    timeout: Option<Duration>,
    /// Direct runs only: asks the monitor to signal the process group.
    cancel_tx: Option<oneshot::Sender<()>>,
    cancel_requested: bool,
    _permit: PoolPermit,
}

pub struct Supervisor {
    config: SupervisorConfig,
    pool: ConcurrencyPool,
    hub: EventHubHandle,
    mode: ExecutionMode,
    companion: Option<CompanionHandle>,
    live: HashMap<TaskId, AgentProcess>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    /// Outcomes produced outside of a completion (fallback, timeouts).
    pending: Vec<(TaskId, ExitOutcome)>,
    next_serial: u64,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, hub: EventHubHandle) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            pool: ConcurrencyPool::new(config.max_concurrent),
            config,
            hub,
            mode: ExecutionMode::Primary,
            companion: None,
            live: HashMap::new(),
            completion_tx,
            completion_rx,
            pending: Vec::new(),
            next_serial: 1,
            shutting_down: false,
        }
    }

    /// Bring up the companion, or switch to fallback if it cannot run.
    pub async fn start(&mut self) {
        if self.mode == ExecutionMode::Fallback || self.companion.is_some() {
            return;
        }
        let Some(binary) = self.config.companion.binary.clone() else {
            self.enter_fallback("no companion configured");
            return;
        };
        let ctx = CompanionContext {
            log_dir: self.config.log_dir.clone(),
            hub: self.hub.clone(),
            completions: self.completion_tx.clone(),
        };
        match CompanionHandle::launch(
            &binary,
            &self.config.companion.args,
            &self.config.agent.binary,
            Duration::from_millis(self.config.companion.startup_probe_ms),
            ctx,
        )
        .await
        {
            Ok(handle) => self.companion = Some(handle),
            Err(e) => self.enter_fallback(&e.to_string()),
        }
    }

    pub const fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, task_id: &TaskId) -> bool {
        self.live.contains_key(task_id)
    }

    /// Slots left under the concurrency ceiling.
    pub fn available_slots(&self) -> usize {
        self.pool.available()
    }

    /// Launch an agent for `task_id`.
    pub async fn spawn(
        &mut self,
        task_id: &TaskId,
        description: &str,
        options: &SpawnOptions,
    ) -> Result<ProcessRef, SupervisorError> {
        if self.shutting_down {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.live.contains_key(task_id) {
            return Err(SupervisorError::AlreadyRunning {
                task_id: task_id.clone(),
            });
        }
        let permit = self.pool.try_acquire().map_err(|e| match e {
            PoolError::Exhausted { max } => SupervisorError::CapacityReached {
                live: self.live.len(),
                max,
            },
            PoolError::Closed => SupervisorError::ShuttingDown,
        })?;

        let serial = self.next_serial;
        self.next_serial += 1;

        if self.mode == ExecutionMode::Primary {
            if let Some(companion) = &self.companion {
                let cmd = ControlCommand::Start {
                    task_id: task_id.clone(),
                    prompt: description.to_string(),
                    model: options.model.clone(),
                    working_directory: options
                        .working_directory
                        .clone()
                        .or_else(|| self.config.agent.working_directory.clone()),
                };
                match companion.send(cmd) {
                    Ok(()) => {
                        info!(task_id = %task_id, serial, model = %options.model, "Task started via companion");
                        self.live.insert(
                            task_id.clone(),
                            AgentProcess {
                                serial,
                                mode: ExecutionMode::Primary,
                                pid: None,
                                started_at: Instant::now(),
                                timeout: options.timeout,
                                cancel_tx: None,
                                cancel_requested: false,
                                _permit: permit,
                            },
                        );
                        return Ok(ProcessRef {
                            task_id: task_id.clone(),
                            serial,
                            mode: ExecutionMode::Primary,
                            pid: None,
                        });
                    }
                    Err(e) => self.enter_fallback(&e.to_string()),
                }
            } else {
                self.enter_fallback("companion not running");
            }
        }

        self.spawn_direct(task_id, description, options, serial, permit)
            .await
    }

    async fn spawn_direct(
        &mut self,
        task_id: &TaskId,
        description: &str,
        options: &SpawnOptions,
        serial: u64,
        permit: PoolPermit,
    ) -> Result<ProcessRef, SupervisorError> {
        let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
            task_id: task_id.clone(),
            reason,
        };

        let sink = TaskSink::open(&self.config.log_dir, task_id)
            .await
            .map_err(|e| spawn_failed(format!("cannot open output log: {e}")))?;

        let working_dir = options
            .working_directory
            .as_deref()
            .or(self.config.agent.working_directory.as_deref());
        let mut child = agent_command(&self.config.agent, &options.model, description, working_dir)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            let id = task_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(task_id = %id, "stderr: {}", line);
                }
            });
        }

        let pump = tokio::spawn(pump_stdout(stdout, sink, task_id.clone(), self.hub.clone()));

        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(monitor(
            child,
            MonitorContext {
                task_id: task_id.clone(),
                serial,
                timeout: options.timeout,
                grace: self.config.grace_period,
                pump,
                cancel_rx,
                hub: self.hub.clone(),
                completions: self.completion_tx.clone(),
            },
        ));

        info!(
            task_id = %task_id,
            serial,
            pid,
            model = %options.model,
            timeout_secs = options.timeout.map(|t| t.as_secs()),
            "Agent spawned"
        );
        self.live.insert(
            task_id.clone(),
            AgentProcess {
                serial,
                mode: ExecutionMode::Fallback,
                pid,
                started_at: Instant::now(),
                timeout: options.timeout,
                cancel_tx: Some(cancel_tx),
                cancel_requested: false,
                _permit: permit,
            },
        );
        Ok(ProcessRef {
            task_id: task_id.clone(),
            serial,
            mode: ExecutionMode::Fallback,
            pid,
        })
    }

    /// Ask a live run to stop. Returns `false` if the task is not live.
    ///
    /// The outcome is reported as `Cancelled` by a later `reconcile`, or as
    /// `Timeout` if the run ignores the signal past its time budget.
    pub fn cancel(&mut self, task_id: &TaskId) -> bool {
        let Some(process) = self.live.get_mut(task_id) else {
            return false;
        };
        process.cancel_requested = true;
        match process.mode {
            ExecutionMode::Fallback => {
                if let Some(tx) = process.cancel_tx.take() {
                    let _ = tx.send(());
                }
            }
            ExecutionMode::Primary => {
                if let Some(companion) = &self.companion
                    && companion
                        .send(ControlCommand::Stop {
                            task_id: task_id.clone(),
                        })
                        .is_err()
                {
                    warn!(task_id = %task_id, "Companion unreachable while cancelling");
                }
            }
        }
        info!(task_id = %task_id, pid = process.pid, "Cancellation requested");
        true
    }

    /// Collect finished runs without blocking.
    pub fn reconcile(&mut self) -> Vec<(TaskId, ExitOutcome)> {
        while let Ok(completion) = self.completion_rx.try_recv() {
            match completion {
                Completion::Exited {
                    task_id,
                    serial,
                    outcome,
                } => self.retire(task_id, serial, outcome),
                Completion::CompanionExited { code } => {
                    if self.mode == ExecutionMode::Primary && !self.shutting_down {
                        self.enter_fallback(&format!(
                            "companion exited unexpectedly (code {code:?})"
                        ));
                    }
                }
            }
        }
        self.expire_primary_runs();
        std::mem::take(&mut self.pending)
    }

    fn retire(&mut self, task_id: TaskId, serial: Option<u64>, outcome: ExitOutcome) {
        let current = self.live.get(&task_id).is_some_and(|p| match serial {
            Some(s) => p.serial == s,
            None => p.mode == ExecutionMode::Primary,
        });
        if !current {
            debug!(task_id = %task_id, ?serial, "Discarding stale completion");
            return;
        }
        let Some(process) = self.live.remove(&task_id) else {
            return;
        };
        let outcome = if process.cancel_requested && !matches!(outcome, ExitOutcome::Timeout { .. })
        {
            ExitOutcome::Cancelled
        } else {
            outcome
        };
        info!(
            task_id = %task_id,
            serial = process.serial,
            mode = %process.mode,
            elapsed_ms = u64::try_from(process.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            ?outcome,
            "Agent run finished"
        );
        self.pending.push((task_id, outcome));
    }

    /// Primary runs have no local monitor; their budgets are checked here.
    fn expire_primary_runs(&mut self) {
        let expired: Vec<(TaskId, Duration)> = self
            .live
            .iter()
            .filter(|(_, p)| p.mode == ExecutionMode::Primary)
            .filter_map(|(id, p)| {
                let budget = p.timeout?;
                (p.started_at.elapsed() >= budget).then(|| (id.clone(), budget))
            })
            .collect();
        for (task_id, after) in expired {
            warn!(task_id = %task_id, timeout_secs = after.as_secs(), "Companion run timed out");
            if let Some(companion) = &self.companion {
                let _ = companion.send(ControlCommand::Stop {
                    task_id: task_id.clone(),
                });
            }
            self.live.remove(&task_id);
            self.hub.finish(&task_id);
            self.pending.push((task_id, ExitOutcome::Timeout { after }));
        }
    }

    /// Switch to direct launches for good. Idempotent.
    ///
    /// Every run that was in the companion's hands is reported as
    /// `Interrupted` by the next `reconcile`.
    pub fn enter_fallback(&mut self, reason: &str) {
        if self.mode == ExecutionMode::Fallback {
            return;
        }
        self.mode = ExecutionMode::Fallback;
        error!(reason, "Companion unavailable, switching to fallback mode");

        if let Some(mut companion) = self.companion.take() {
            companion.teardown();
        }

        let lost: Vec<TaskId> = self
            .live
            .iter()
            .filter(|(_, p)| p.mode == ExecutionMode::Primary)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in lost {
            self.live.remove(&task_id);
            self.hub.finish(&task_id);
            warn!(task_id = %task_id, "Run lost with the companion");
            self.pending.push((
                task_id,
                ExitOutcome::Interrupted {
                    reason: "companion unavailable".to_string(),
                },
            ));
        }
    }

    /// Stop everything.
    ///
    /// Runs that finish on their own during the grace period keep their real
    /// outcome; every other run still live is reported as `Interrupted`.
    pub async fn shutdown(&mut self) -> Vec<(TaskId, ExitOutcome)> {
        self.shutting_down = true;
        self.pool.close();
        info!(live = self.live.len(), "Supervisor shutting down");

        let mut outcomes = self.reconcile();

        let ids: Vec<TaskId> = self.live.keys().cloned().collect();
        for task_id in &ids {
            if let Some(process) = self.live.get_mut(task_id)
                && let Some(tx) = process.cancel_tx.take()
            {
                let _ = tx.send(());
            }
        }
        if let Some(companion) = &self.companion {
            let _ = companion.send(ControlCommand::Shutdown);
        }

        // Give direct runs the grace period to exit so their output is flushed.
        let deadline = Instant::now() + self.config.grace_period;
        while self
            .live
            .values()
            .any(|p| p.mode == ExecutionMode::Fallback)
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.completion_rx.recv()).await {
                Ok(Some(Completion::Exited {
                    task_id,
                    serial,
                    outcome,
                })) => {
                    let current = self
                        .live
                        .get(&task_id)
                        .is_some_and(|p| serial.is_none_or(|s| s == p.serial));
                    // A run that ended on its own keeps its real outcome.
                    if current && outcome != ExitOutcome::Cancelled {
                        self.live.remove(&task_id);
                        info!(task_id = %task_id, ?outcome, "Agent run finished during shutdown");
                        outcomes.push((task_id, outcome));
                    } else if current {
                        self.live.remove(&task_id);
                    }
                }
                Ok(Some(Completion::CompanionExited { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }

        if let Some(mut companion) = self.companion.take() {
            companion.teardown();
        }

        let finished: Vec<TaskId> = outcomes.iter().map(|(id, _)| id.clone()).collect();
        let mut interrupted: Vec<TaskId> = ids
            .into_iter()
            .filter(|id| !finished.contains(id))
            .collect();
        interrupted.sort();
        for task_id in interrupted {
            self.live.remove(&task_id);
            outcomes.push((
                task_id,
                ExitOutcome::Interrupted {
                    reason: "scheduler shut down".to_string(),
                },
            ));
        }
        outcomes
    }
}

struct MonitorContext {
    task_id: TaskId,
    serial: u64,
    timeout: Option<Duration>,
    grace: Duration,
    pump: tokio::task::JoinHandle<()>,
    cancel_rx: oneshot::Receiver<()>,
    hub: EventHubHandle,
    completions: mpsc::UnboundedSender<Completion>,
}

/// Wait for a direct run to end, enforcing its timeout and honouring cancel.
async fn monitor(mut child: Child, ctx: MonitorContext) {
    let MonitorContext {
        task_id,
        serial,
        timeout,
        grace,
        mut pump,
        mut cancel_rx,
        hub,
        completions,
    } = ctx;
    let pid = child.id();

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        status = child.wait() => exit_outcome(&task_id, status),
        _ = &mut cancel_rx => {
            info!(task_id = %task_id, "Sending SIGTERM to agent process group");
            if let Some(pid) = child.id() {
                terminate_group(pid);
            }
            // The run's time budget still bounds the wait.
            tokio::select! {
                status = child.wait() => match exit_outcome(&task_id, status) {
                    ExitOutcome::Success => ExitOutcome::Success,
                    _ => ExitOutcome::Cancelled,
                },
                () = &mut deadline => {
                    let after = timeout.unwrap_or_default();
                    warn!(task_id = %task_id, timeout_secs = after.as_secs(), "Cancelled agent ignored SIGTERM until its timeout");
                    shutdown_child(&mut child, grace).await;
                    ExitOutcome::Timeout { after }
                }
            }
        }
        () = &mut deadline => {
            let after = timeout.unwrap_or_default();
            warn!(task_id = %task_id, timeout_secs = after.as_secs(), "Agent timed out, sending SIGTERM");
            shutdown_child(&mut child, grace).await;
            ExitOutcome::Timeout { after }
        }
    };

    // All output must be in the sink and the hub before the run is reported.
    // A helper process that outlives the agent can hold stdout open, so the
    // group is signalled once the grace period passes and the pump is
    // abandoned after a second one.
    let drained = match tokio::time::timeout(grace, &mut pump).await {
        Ok(joined) => Some(joined),
        Err(_) => {
            warn!(task_id = %task_id, "Agent output still open after exit, signalling process group");
            if let Some(pid) = pid {
                terminate_group(pid);
            }
            tokio::time::timeout(grace, &mut pump).await.ok()
        }
    };
    match drained {
        Some(Ok(())) => {}
        Some(Err(e)) => warn!(task_id = %task_id, error = %e, "Output pump failed"),
        None => {
            warn!(task_id = %task_id, "Abandoning agent output pump");
            pump.abort();
        }
    }
    hub.finish(&task_id);

    debug!(task_id = %task_id, serial, ?outcome, "Agent monitor finished");
    let _ = completions.send(Completion::Exited {
        task_id,
        serial: Some(serial),
        outcome,
    });
}

fn exit_outcome(
    task_id: &TaskId,
    status: std::io::Result<std::process::ExitStatus>,
) -> ExitOutcome {
    match status {
        Ok(status) => ExitOutcome::from_exit_code(status.code()),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Failed to wait for agent");
            ExitOutcome::Failure {
                message: format!("wait failed: {e}"),
            }
        }
    }
}

/// Copy agent stdout to the task sink and the event hub, chunk by chunk.
async fn pump_stdout(
    mut stdout: ChildStdout,
    mut sink: TaskSink,
    task_id: TaskId,
    hub: EventHubHandle,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if let Err(e) = sink.write(chunk).await {
                    warn!(task_id = %task_id, path = %sink.path().display(), error = %e, "Failed to write task sink");
                }
                hub.on_data(&task_id, chunk.to_vec());
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to read agent stdout");
                break;
            }
        }
    }
    debug!(task_id = %task_id, "stdout reader finished");
}
