//! Named agents, their executors, and the per-agent health state machine.
//!
//! The registry never inspects what an agent does. It drives each agent
//! through an explicit state machine:
//!
//! healthy -> running -> healthy           (execute succeeded)
//!                    -> error(n)          (execute failed, n < max)
//!                    -> unhealthy         (n reached max)
//! unhealthy -> healthy                    (restart succeeded)
//!
//! Execution failures are absorbed into the state machine and the registry's
//! counters; only an unknown agent name surfaces as an error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::errors::AgentError;

/// Consecutive execute failures before an agent is declared unhealthy.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// How recently an agent must have been checked to count as activatable.
pub const HEALTH_FRESHNESS_SECS: i64 = 60;

/// An opaque unit of work. The core only knows it can be executed and
/// restarted, each reporting success or failure.
#[async_trait::async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self) -> anyhow::Result<()>;
    async fn restart(&self) -> anyhow::Result<()>;
}

/// Health state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentStatus {
    Healthy,
    /// Mid-execution; carries the error streak from before the run so a
    /// failure can extend it.
    Running { prior_errors: u32 },
    Error { consecutive: u32 },
    Unhealthy,
}

impl AgentStatus {
    pub fn consecutive_errors(&self) -> u32 {
        match self {
            AgentStatus::Running { prior_errors } => *prior_errors,
            AgentStatus::Error { consecutive } => *consecutive,
            AgentStatus::Unhealthy => MAX_CONSECUTIVE_ERRORS,
            AgentStatus::Healthy => 0,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Healthy => write!(f, "healthy"),
            AgentStatus::Running { .. } => write!(f, "running"),
            AgentStatus::Error { consecutive } => write!(f, "error({consecutive})"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

struct AgentRecord {
    executor: Arc<dyn AgentExecutor>,
    status: AgentStatus,
    last_checked: DateTime<Utc>,
    restart_count: u32,
}

/// Serializable per-agent health snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AgentHealth {
    pub name: String,
    pub status: AgentStatus,
    pub consecutive_errors: u32,
    pub last_checked: DateTime<Utc>,
    pub restart_count: u32,
}

/// Tracks named agents and drives their health state machines.
#[derive(Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent as healthy with a fresh check timestamp, so it is
    /// activatable before the first health sweep.
    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn AgentExecutor>) {
        let name = name.into();
        debug!(agent = %name, "agent registered");
        self.agents.insert(
            name,
            AgentRecord {
                executor,
                status: AgentStatus::Healthy,
                last_checked: Utc::now(),
                restart_count: 0,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Whether the agent is currently activatable: error count below the
    /// threshold, a check within the freshness window, and not mid-run or
    /// declared unhealthy. Agents below the error threshold stay
    /// activatable so failures can accumulate toward it.
    pub fn is_healthy(&self, name: &str) -> bool {
        let Some(record) = self.agents.get(name) else {
            return false;
        };
        let fresh = (Utc::now() - record.last_checked).num_seconds() < HEALTH_FRESHNESS_SECS;
        let activatable = matches!(
            record.status,
            AgentStatus::Healthy | AgentStatus::Error { .. }
        );
        activatable && record.status.consecutive_errors() < MAX_CONSECUTIVE_ERRORS && fresh
    }

    /// Mark the agent running and hand back its executor, or None when the
    /// agent is not activatable. The caller runs the executor without
    /// holding the registry and reports back via [`finish_activation`].
    ///
    /// [`finish_activation`]: AgentRegistry::finish_activation
    pub fn begin_activation(
        &mut self,
        name: &str,
    ) -> Result<Option<Arc<dyn AgentExecutor>>, AgentError> {
        if !self.agents.contains_key(name) {
            return Err(AgentError::UnknownAgent {
                name: name.to_string(),
            });
        }
        if !self.is_healthy(name) {
            warn!(agent = %name, "activation rejected, agent not healthy");
            return Ok(None);
        }
        let record = self
            .agents
            .get_mut(name)
            .ok_or_else(|| AgentError::UnknownAgent {
                name: name.to_string(),
            })?;
        let prior_errors = record.status.consecutive_errors();
        record.status = AgentStatus::Running { prior_errors };
        Ok(Some(record.executor.clone()))
    }

    /// Record the outcome of an execution started by [`begin_activation`].
    /// Failures feed the error streak; the streak reaching the threshold
    /// declares the agent unhealthy.
    ///
    /// [`begin_activation`]: AgentRegistry::begin_activation
    pub fn finish_activation(&mut self, name: &str, outcome: anyhow::Result<()>) -> bool {
        let Some(record) = self.agents.get_mut(name) else {
            return false;
        };
        record.last_checked = Utc::now();
        match outcome {
            Ok(()) => {
                record.status = AgentStatus::Healthy;
                info!(agent = %name, "agent execution succeeded");
                true
            }
            Err(e) => {
                let consecutive = record.status.consecutive_errors() + 1;
                record.status = if consecutive >= MAX_CONSECUTIVE_ERRORS {
                    warn!(agent = %name, consecutive, error = %e, "agent declared unhealthy");
                    AgentStatus::Unhealthy
                } else {
                    warn!(agent = %name, consecutive, error = %e, "agent execution failed");
                    AgentStatus::Error { consecutive }
                };
                false
            }
        }
    }

    /// Run the agent's executor once, driving the state machine.
    ///
    /// Returns Ok(false) without executing when the agent is not healthy.
    /// Execution failure is absorbed into the agent's state, not propagated.
    pub async fn activate(&mut self, name: &str) -> Result<bool, AgentError> {
        let Some(executor) = self.begin_activation(name)? else {
            return Ok(false);
        };
        let outcome = executor.execute().await;
        Ok(self.finish_activation(name, outcome))
    }

    /// Sweep all agents: refresh check timestamps and attempt a restart of
    /// every unhealthy agent.
    pub async fn health_check(&mut self) {
        let names: Vec<String> = self.agents.keys().cloned().collect();
        for name in names {
            let (executor, unhealthy) = {
                let record = match self.agents.get_mut(&name) {
                    Some(record) => record,
                    None => continue,
                };
                record.last_checked = Utc::now();
                (
                    record.executor.clone(),
                    record.status == AgentStatus::Unhealthy,
                )
            };
            if !unhealthy {
                continue;
            }

            info!(agent = %name, "restarting unhealthy agent");
            let outcome = executor.restart().await;
            if let Some(record) = self.agents.get_mut(&name) {
                record.last_checked = Utc::now();
                match outcome {
                    Ok(()) => {
                        record.status = AgentStatus::Healthy;
                        record.restart_count += 1;
                        info!(agent = %name, restarts = record.restart_count, "agent restarted");
                    }
                    Err(e) => {
                        warn!(agent = %name, error = %e, "agent restart failed");
                    }
                }
            }
        }
    }

    pub fn status_of(&self, name: &str) -> Option<AgentStatus> {
        self.agents.get(name).map(|r| r.status)
    }

    /// Health snapshot of every registered agent, ordered by name.
    pub fn snapshot(&self) -> Vec<AgentHealth> {
        self.agents
            .iter()
            .map(|(name, record)| AgentHealth {
                name: name.clone(),
                status: record.status,
                consecutive_errors: record.status.consecutive_errors(),
                last_checked: record.last_checked,
                restart_count: record.restart_count,
            })
            .collect()
    }
}
