//! Runtime configuration for conductor.
//!
//! Settings come from `conductor.toml` in the project directory when present,
//! with built-in defaults otherwise. The runtime `Config` resolves all state
//! paths under `.conductor/`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::phase::PhasePlan;

fn default_main_interval_secs() -> u64 {
    30
}
fn default_health_interval_secs() -> u64 {
    60
}
fn default_task_interval_secs() -> u64 {
    10
}
fn default_max_concurrent_tasks() -> usize {
    3
}
fn default_lock_stale_secs() -> u64 {
    300
}
fn default_lock_max_attempts() -> u32 {
    10
}
fn default_lock_retry_delay_ms() -> u64 {
    1000
}
fn default_backup_interval_secs() -> u64 {
    300
}
fn default_backup_retention() -> usize {
    10
}
fn default_agent_timeout_secs() -> u64 {
    300
}

/// Scheduler loop cadence and concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerSettings {
    #[serde(default = "default_main_interval_secs")]
    pub main_interval_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_task_interval_secs")]
    pub task_interval_secs: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            main_interval_secs: default_main_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            task_interval_secs: default_task_interval_secs(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

/// Lock staleness and acquisition retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockSettings {
    #[serde(default = "default_lock_stale_secs")]
    pub stale_secs: u64,
    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_secs: default_lock_stale_secs(),
            max_attempts: default_lock_max_attempts(),
            retry_delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

/// Backup throttle interval and retention count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupSettings {
    #[serde(default = "default_backup_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_backup_retention")]
    pub retention: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_backup_interval_secs(),
            retention: default_backup_retention(),
        }
    }
}

/// A declaratively configured command agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    /// Shell command run on `execute()`
    pub command: String,
    /// Shell command run on `restart()`; defaults to re-running `command`
    #[serde(default)]
    pub restart_command: Option<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

/// The `conductor.toml` file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConductorFile {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub lock: LockSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    /// Ordered phase plan; the built-in default plan applies when empty
    #[serde(default)]
    pub phases: Vec<crate::phase::PhaseSpec>,
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
}

impl ConductorFile {
    /// Load `conductor.toml` from the project directory, falling back to
    /// defaults when the file does not exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("conductor.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub backup_dir: PathBuf,
    pub stop_file: PathBuf,
    pub verbose: bool,
    pub scheduler: SchedulerSettings,
    pub lock: LockSettings,
    pub backup: BackupSettings,
    pub plan: PhasePlan,
    pub agents: Vec<AgentDefinition>,
}

impl Config {
    /// Create a new Config rooted at the given project directory.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let file = ConductorFile::load(&project_dir)?;
        let plan = if file.phases.is_empty() {
            PhasePlan::default()
        } else {
            PhasePlan::new(file.phases.clone())
        };

        let conductor_dir = project_dir.join(".conductor");
        Ok(Self {
            state_file: conductor_dir.join("workflow.json"),
            lock_file: conductor_dir.join("workflow.lock"),
            backup_dir: conductor_dir.join("backups"),
            stop_file: conductor_dir.join("stop-requested"),
            project_dir,
            verbose,
            scheduler: file.scheduler,
            lock: file.lock,
            backup: file.backup,
            plan,
            agents: file.agents,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.backup_dir)
            .context("Failed to create backup directory")?;
        Ok(())
    }

    pub fn main_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.main_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.health_interval_secs)
    }

    pub fn task_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.task_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_config_defaults_without_file() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        assert_eq!(config.scheduler.main_interval_secs, 30);
        assert_eq!(config.scheduler.health_interval_secs, 60);
        assert_eq!(config.scheduler.task_interval_secs, 10);
        assert_eq!(config.scheduler.max_concurrent_tasks, 3);
        assert_eq!(config.lock.stale_secs, 300);
        assert_eq!(config.lock.max_attempts, 10);
        assert_eq!(config.backup.retention, 10);
        assert_eq!(config.plan, PhasePlan::default());
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_config_paths_under_conductor_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        let root = dir.path().canonicalize().unwrap().join(".conductor");
        assert_eq!(config.state_file, root.join("workflow.json"));
        assert_eq!(config.lock_file, root.join("workflow.lock"));
        assert_eq!(config.backup_dir, root.join("backups"));
    }

    #[test]
    fn test_config_loads_toml_overrides() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("conductor.toml"),
            r#"
            [scheduler]
            main_interval_secs = 5
            max_concurrent_tasks = 1

            [backup]
            retention = 3

            [[phases]]
            name = "only"
            agents = ["solo"]
            duration_secs = 60

            [[agents]]
            name = "solo"
            command = "true"
            "#,
        )
        .unwrap();

        let config = Config::new(dir.path().to_path_buf(), true).unwrap();
        assert_eq!(config.scheduler.main_interval_secs, 5);
        assert_eq!(config.scheduler.max_concurrent_tasks, 1);
        // Unset sections keep their defaults
        assert_eq!(config.scheduler.health_interval_secs, 60);
        assert_eq!(config.backup.retention, 3);
        assert_eq!(config.plan.len(), 1);
        assert_eq!(config.plan.first().unwrap().name, "only");
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].timeout_secs, 300);
    }

    #[test]
    fn test_config_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("conductor.toml"), "not [valid").unwrap();
        assert!(Config::new(dir.path().to_path_buf(), false).is_err());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.backup_dir.exists());
    }
}
