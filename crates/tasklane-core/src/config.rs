//! Configuration resolution for tasklane.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/tasklane/settings.json`)
//! 3. Project config (`.tasklane/settings.json`)
//! 4. Environment variables (`TASKLANE_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Settings files may be partial. Objects are merged key by key, so a project
//! file that only sets `agent.default_model` keeps every other value from the
//! layers below it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Complete tasklane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub companion: CompanionConfig,
    /// Execution profiles selected by task tag.
    pub profiles: BTreeMap<String, Profile>,
}

/// Reconciliation loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub task_file: PathBuf,
    pub tick_ms: u64,
    pub max_concurrent: usize,
    /// Directory for per-task output sinks. Resolved by the daemon when unset.
    pub log_dir: Option<PathBuf>,
    /// Run an extra tick when the task file changes on disk.
    pub watch_task_file: bool,
    pub log_level: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_file: PathBuf::from("TASKS.md"),
            tick_ms: 2_000,
            max_concurrent: 3,
            log_dir: None,
            watch_task_file: false,
            log_level: "info".to_string(),
        }
    }
}

/// How the agent binary is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub binary: PathBuf,
    /// Arguments placed before the generated flags.
    pub base_args: Vec<String>,
    /// Arguments placed after the generated flags, before the prompt.
    pub extra_args: Vec<String>,
    pub default_model: String,
    /// Wall-clock budget per task. `0` disables the timeout.
    pub timeout_secs: u64,
    pub working_directory: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            base_args: Vec::new(),
            extra_args: Vec::new(),
            default_model: "sonnet".to_string(),
            timeout_secs: 30 * 60,
            working_directory: None,
        }
    }
}

/// Companion orchestrator used in primary mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// `None` starts the supervisor directly in fallback mode.
    pub binary: Option<PathBuf>,
    pub args: Vec<String>,
    /// How long the companion must stay up after launch to count as started.
    pub startup_probe_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            binary: None,
            args: Vec::new(),
            startup_probe_ms: 500,
        }
    }
}

/// Per-tag overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Profile {
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Model and timeout chosen for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub profile: Option<String>,
    pub model: String,
    pub timeout: Option<Duration>,
}

impl Config {
    /// Pick the execution settings for a task with the given tags.
    ///
    /// The first tag, in sorted order, that names a profile wins.
    pub fn execution_for(&self, tags: &BTreeSet<String>) -> Execution {
        let matched = tags
            .iter()
            .find_map(|tag| self.profiles.get(tag).map(|p| (tag, p)));
        let model = matched
            .and_then(|(_, p)| p.model.clone())
            .unwrap_or_else(|| self.agent.default_model.clone());
        let timeout_secs = matched
            .and_then(|(_, p)| p.timeout_secs)
            .unwrap_or(self.agent.timeout_secs);
        Execution {
            profile: matched.map(|(tag, _)| tag.clone()),
            model,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }

    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_ms)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(Error::Config("scheduler.max_concurrent must be at least 1".into()));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(Error::Config("scheduler.tick_ms must be positive".into()));
        }
        if self.agent.binary.as_os_str().is_empty() {
            return Err(Error::Config("agent.binary must not be empty".into()));
        }
        if self.agent.default_model.trim().is_empty() {
            return Err(Error::Config("agent.default_model must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration source priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    Global = 1,
    Project = 2,
    Environment = 3,
    Cli = 4,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(project_config_path);
    load_layers(
        global.as_deref(),
        project.as_deref(),
        |key| std::env::var(key).ok(),
    )
}

/// Resolve configuration from explicit file layers and an environment lookup.
pub fn load_layers(
    global: Option<&Path>,
    project: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    for (source, path) in [(ConfigSource::Global, global), (ConfigSource::Project, project)] {
        let Some(path) = path.filter(|p| p.exists()) else {
            continue;
        };
        debug!(?source, path = %path.display(), "Loading settings file");
        merge_json(&mut merged, load_config_file(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid settings: {e}")))?;
    apply_env_overrides(&mut config, env)?;
    Ok(config)
}

/// Global settings file location.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tasklane").join("settings.json"))
}

pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".tasklane").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursive object merge; non-object overlay values replace the base.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn apply_env_overrides(config: &mut Config, env: impl Fn(&str) -> Option<String>) -> Result<()> {
    fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
        value
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key}: cannot parse '{value}'")))
    }

    if let Some(val) = env("TASKLANE_TASK_FILE") {
        config.scheduler.task_file = PathBuf::from(val);
    }
    if let Some(val) = env("TASKLANE_MAX_CONCURRENT") {
        config.scheduler.max_concurrent = parsed("TASKLANE_MAX_CONCURRENT", &val)?;
    }
    if let Some(val) = env("TASKLANE_TICK_MS") {
        config.scheduler.tick_ms = parsed("TASKLANE_TICK_MS", &val)?;
    }
    if let Some(val) = env("TASKLANE_LOG_DIR") {
        config.scheduler.log_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = env("TASKLANE_WATCH") {
        config.scheduler.watch_task_file = matches!(val.trim(), "1" | "true" | "yes" | "on");
    }
    if let Some(val) = env("TASKLANE_LOG_LEVEL") {
        config.scheduler.log_level = val;
    }
    if let Some(val) = env("TASKLANE_AGENT_BIN") {
        config.agent.binary = PathBuf::from(val);
    }
    if let Some(val) = env("TASKLANE_MODEL") {
        config.agent.default_model = val;
    }
    if let Some(val) = env("TASKLANE_TIMEOUT_SECS") {
        config.agent.timeout_secs = parsed("TASKLANE_TIMEOUT_SECS", &val)?;
    }
    if let Some(val) = env("TASKLANE_COMPANION_BIN") {
        config.companion.binary = (!val.is_empty()).then(|| PathBuf::from(val));
    }
    Ok(())
}
