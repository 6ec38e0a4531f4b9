//! The reconciliation loop.
//!
//! Each tick reloads the task document, starts eligible tasks up to the free
//! concurrency budget, collects finished runs and writes their outcomes back.
//! The document on disk is the only durable state; everything else is rebuilt
//! from it after a restart.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use tasklane_core::{
    Config, Document, TaskFile, TaskId, TaskLocator, TaskStatus, TaskUpdate, eligible,
};

use crate::subprocess::{ExitOutcome, SpawnOptions, Supervisor, SupervisorError};

/// Error text written for runs lost to a daemon restart.
pub const RESTART_ERROR: &str = "interrupted: scheduler restarted";

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Tasks eligible when the document was read.
    pub eligible: usize,
    pub spawned: Vec<TaskId>,
    pub finished: Vec<(TaskId, ExitOutcome)>,
}

/// Errors that abort a tick. The loop logs them and retries next tick.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Task(#[from] tasklane_core::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] JoinError),
}

struct Candidate {
    locator: TaskLocator,
    description: String,
    tags: BTreeSet<String>,
}

pub struct Reconciler {
    config: Config,
    file: TaskFile,
    supervisor: Supervisor,
    /// Where each live run's task was found when it started.
    running: HashMap<TaskId, TaskLocator>,
}

impl Reconciler {
    pub fn new(config: Config, supervisor: Supervisor) -> Self {
        let file = TaskFile::new(config.scheduler.task_file.clone());
        Self {
            config,
            file,
            supervisor,
            running: HashMap::new(),
        }
    }

    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    /// Run until `shutdown` fires, then stop every live run.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut wake: Option<mpsc::Receiver<()>>,
    ) {
        self.supervisor.start().await;
        match self.recover_stale().await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Marked interrupted tasks as failed"),
            Err(e) => error!(error = %e, "Failed to recover stale tasks"),
        }

        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            path = %self.file.path().display(),
            tick_ms = self.config.scheduler.tick_ms,
            mode = %self.supervisor.mode(),
            "Reconciliation loop started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("Shutdown requested");
                    break;
                }
                Some(()) = next_wake(&mut wake) => {
                    debug!("Task file changed, reconciling early");
                }
            }
            match self.tick().await {
                Ok(report) if !report.spawned.is_empty() || !report.finished.is_empty() => {
                    info!(
                        eligible = report.eligible,
                        spawned = report.spawned.len(),
                        finished = report.finished.len(),
                        live = self.supervisor.live_count(),
                        "Tick"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Reconciliation tick failed"),
            }
        }

        let outcomes = self.supervisor.shutdown().await;
        for (task_id, outcome) in outcomes {
            self.apply(task_id, &outcome).await;
        }
        info!("Reconciliation loop stopped");
    }

    /// One reconciliation pass.
    pub async fn tick(&mut self) -> Result<TickReport, ReconcileError> {
        let mut document = self.load().await?;
        let candidates: Vec<Candidate> = eligible(&document)
            .iter()
            .map(|e| Candidate {
                locator: e.locator(),
                description: e.task.description.clone(),
                tags: e.task.tags.clone(),
            })
            .collect();
        let mut report = TickReport {
            eligible: candidates.len(),
            ..TickReport::default()
        };

        for candidate in candidates {
            if self.supervisor.available_slots() == 0 {
                break;
            }
            if let Some(task_id) = self.start(&mut document, candidate).await {
                report.spawned.push(task_id);
            }
        }

        for (task_id, outcome) in self.supervisor.reconcile() {
            self.apply(task_id.clone(), &outcome).await;
            report.finished.push((task_id, outcome));
        }
        Ok(report)
    }

    /// Mark `in_progress` tasks that have no live run as failed.
    pub async fn recover_stale(&mut self) -> Result<usize, ReconcileError> {
        let document = self.load().await?;
        let stale: Vec<TaskLocator> = document
            .tasks()
            .filter(|(_, t)| t.status == TaskStatus::InProgress)
            .filter(|(_, t)| t.id.as_ref().is_none_or(|id| !self.supervisor.is_live(id)))
            .map(|(group, t)| TaskLocator::of(group, t))
            .collect();

        let mut recovered = 0;
        for locator in stale {
            match self.write(locator.clone(), TaskUpdate::failed(RESTART_ERROR)).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(description = %locator.description, error = %e, "Failed to recover task"),
            }
        }
        Ok(recovered)
    }

    async fn start(&mut self, document: &mut Document, candidate: Candidate) -> Option<TaskId> {
        let Candidate {
            locator,
            description,
            tags,
        } = candidate;
        let task_id = locator.id.clone().unwrap_or_else(|| document.next_task_id());
        if self.supervisor.is_live(&task_id) {
            // Reset by hand while still running; the live run keeps it.
            debug!(task_id = %task_id, "Eligible task is already running");
            return None;
        }

        // Carrying the id keeps the write off same-description tasks that
        // already hold another id.
        let locator = locator.with_id(task_id.clone());
        match self
            .write(locator.clone(), TaskUpdate::started(task_id.clone()))
            .await
        {
            Ok(next) => *document = next,
            Err(e) => {
                warn!(task_id = %task_id, description = %description, error = %e, "Failed to mark task started");
                return None;
            }
        }

        let execution = self.config.execution_for(&tags);
        let options = SpawnOptions {
            model: execution.model,
            timeout: execution.timeout,
            working_directory: None,
        };
        match self
            .supervisor
            .spawn(&task_id, &description, &options)
            .await
        {
            Ok(process) => {
                info!(
                    task_id = %task_id,
                    group = %locator.group,
                    profile = ?execution.profile,
                    mode = %process.mode,
                    "Task started"
                );
                self.running.insert(task_id.clone(), locator);
                Some(task_id)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to start task");
                let message = match e {
                    SupervisorError::SpawnFailed { reason, .. } => format!("launch failed: {reason}"),
                    other => other.to_string(),
                };
                if let Err(e) = self.write(locator, TaskUpdate::failed(message)).await {
                    warn!(task_id = %task_id, error = %e, "Failed to record launch failure");
                }
                None
            }
        }
    }

    async fn apply(&mut self, task_id: TaskId, outcome: &ExitOutcome) {
        let locator = self
            .running
            .remove(&task_id)
            .unwrap_or_else(|| TaskLocator::by_id(task_id.clone()));
        let update = match outcome.error_text() {
            None => TaskUpdate::succeeded(),
            Some(text) => TaskUpdate::failed(text),
        };
        match self.write(locator, update).await {
            Ok(_) => info!(task_id = %task_id, ?outcome, "Task outcome written"),
            Err(e) => warn!(task_id = %task_id, ?outcome, error = %e, "Failed to write task outcome"),
        }
    }

    async fn load(&self) -> Result<Document, ReconcileError> {
        let file = self.file.clone();
        Ok(tokio::task::spawn_blocking(move || file.load()).await??)
    }

    async fn write(
        &self,
        locator: TaskLocator,
        update: TaskUpdate,
    ) -> Result<Document, ReconcileError> {
        let file = self.file.clone();
        Ok(tokio::task::spawn_blocking(move || file.update(&locator, &update)).await??)
    }
}

async fn next_wake(wake: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match wake {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
