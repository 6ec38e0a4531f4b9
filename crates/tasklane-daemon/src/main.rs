//! `tasklane`
//!
//! Watches a Markdown task document and runs each eligible task through a
//! coding agent, writing status and outcome markers back into the document.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use tasklane_core::config::load_config;
use tasklane_core::tasks::TaskFile;
use tasklane_core::tracing_init::{default_filter, init_tracing};
use tasklane_core::{Config, TaskStatus, eligible};
use tasklane_daemon::orchestration::Reconciler;
use tasklane_daemon::stream::EventHub;
use tasklane_daemon::subprocess::{Supervisor, SupervisorConfig};
use tasklane_daemon::watch::TaskFileWatcher;

#[derive(Parser, Debug)]
#[command(name = "tasklane")]
#[command(version, about = "tasklane - runs a Markdown task list through a coding agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reconciliation loop until interrupted
    Run(RunArgs),
    /// Parse the task document and show what would run next
    Check {
        /// Task document path
        #[arg(long, env = "TASKLANE_TASK_FILE")]
        tasks: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Task document path
    #[arg(long, env = "TASKLANE_TASK_FILE")]
    tasks: Option<PathBuf>,

    /// Maximum concurrent agent processes
    #[arg(long, env = "TASKLANE_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Reconciliation interval in milliseconds
    #[arg(long, env = "TASKLANE_TICK_MS")]
    tick_ms: Option<u64>,

    /// Path to the agent CLI binary
    #[arg(long, env = "TASKLANE_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Companion orchestrator binary (enables primary mode)
    #[arg(long, env = "TASKLANE_COMPANION_BIN")]
    companion_bin: Option<PathBuf>,

    /// Default model for tasks without a matching profile
    #[arg(long, env = "TASKLANE_MODEL")]
    model: Option<String>,

    /// Per-run time budget in seconds (0 disables it)
    #[arg(long, env = "TASKLANE_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Directory for per-task output logs
    #[arg(long, env = "TASKLANE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Reconcile as soon as the task document changes
    #[arg(long, env = "TASKLANE_WATCH")]
    watch: bool,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, env = "TASKLANE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "TASKLANE_LOG_JSON")]
    log_json: bool,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        if let Some(tasks) = self.tasks {
            config.scheduler.task_file = tasks;
        }
        if let Some(n) = self.max_concurrent {
            config.scheduler.max_concurrent = n;
        }
        if let Some(ms) = self.tick_ms {
            config.scheduler.tick_ms = ms;
        }
        if let Some(bin) = self.agent_bin {
            config.agent.binary = bin;
        }
        if let Some(bin) = self.companion_bin {
            config.companion.binary = Some(bin);
        }
        if let Some(model) = self.model {
            config.agent.default_model = model;
        }
        if let Some(secs) = self.timeout_secs {
            config.agent.timeout_secs = secs;
        }
        if let Some(dir) = self.log_dir {
            config.scheduler.log_dir = Some(dir);
        }
        if self.watch {
            config.scheduler.watch_task_file = true;
        }
        if let Some(level) = self.log_level {
            config.scheduler.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Cannot resolve working directory")?;
    let mut config = load_config(Some(cwd.as_path()))?;

    match cli.command {
        Command::Run(args) => {
            let log_json = args.log_json;
            args.apply(&mut config);
            config.validate()?;
            init_tracing(&default_filter(&config.scheduler.log_level), log_json);
            run(config).await
        }
        Command::Check { tasks } => {
            if let Some(tasks) = tasks {
                config.scheduler.task_file = tasks;
            }
            init_tracing(&default_filter("warn"), false);
            check(&config.scheduler.task_file)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let log_dir = resolve_log_dir(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        task_file = %config.scheduler.task_file.display(),
        max_concurrent = config.scheduler.max_concurrent,
        companion = config.companion.binary.is_some(),
        log_dir = %log_dir.display(),
        "Starting tasklane"
    );
    tokio::fs::create_dir_all(&log_dir)
        .await
        .with_context(|| format!("Cannot create log directory {}", log_dir.display()))?;

    let (hub, hub_task) = EventHub::spawn();
    let supervisor = Supervisor::new(SupervisorConfig::from_config(&config, log_dir), hub);

    // The guard must outlive the loop or the wake-ups stop.
    let (_watch_guard, wake) = if config.scheduler.watch_task_file {
        let (guard, rx) = TaskFileWatcher::start(&config.scheduler.task_file)
            .context("Cannot watch task file")?;
        (Some(guard), Some(rx))
    } else {
        (None, None)
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut reconciler = Reconciler::new(config, supervisor);
    let loop_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx, wake).await;
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so agent processes cannot notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    loop_handle.await.context("Reconciliation loop panicked")?;
    hub_task.abort();
    info!("tasklane stopped");
    Ok(())
}

fn resolve_log_dir(config: &Config) -> PathBuf {
    config.scheduler.log_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir().map_or_else(
            || PathBuf::from(".tasklane").join("logs"),
            |dir| dir.join("tasklane").join("logs"),
        )
    })
}

#[allow(clippy::print_stdout)]
fn check(path: &Path) -> anyhow::Result<()> {
    let document = TaskFile::new(path)
        .load()
        .with_context(|| format!("Cannot read {}", path.display()))?;

    for warning in &document.warnings {
        println!("warning: line {}: {}", warning.line, warning.message);
    }
    for group in &document.groups {
        let counts = group
            .status_counts()
            .map(|(status, n)| format!("{n} {}", status_label(status)));
        let name = if group.name.is_empty() {
            "(ungrouped)"
        } else {
            group.name.as_str()
        };
        println!("{name}: {}", counts.join(", "));
    }

    let next = eligible(&document);
    if next.is_empty() {
        println!("no eligible tasks");
    }
    for entry in next {
        let id = entry
            .task
            .id
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        println!("eligible: [{}] {} ({id})", entry.group, entry.task.description);
    }
    Ok(())
}

const fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Blocked => "blocked",
        TaskStatus::InProgress => "in progress",
        TaskStatus::Done => "done",
        TaskStatus::Failed => "failed",
    }
}
