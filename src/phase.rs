//! Phase definitions for the workflow state machine.
//!
//! This module provides:
//! - `PhaseSpec` describing a single named phase (agents, duration budget)
//! - `PhasePlan` holding the fixed, ordered phase sequence
//! - The default plan used when `conductor.toml` does not override it

use serde::{Deserialize, Serialize};

fn default_checkpoint_secs() -> u64 {
    300
}

/// A single named stage in the fixed, ordered workflow sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSpec {
    /// Phase name (e.g., "planning")
    pub name: String,
    /// Names of agents assigned to this phase
    #[serde(default)]
    pub agents: Vec<String>,
    /// Duration budget in seconds; when exhausted the phase is force-completed
    pub duration_secs: u64,
    /// Interval between progress checkpoints in seconds
    #[serde(default = "default_checkpoint_secs")]
    pub checkpoint_secs: u64,
}

impl PhaseSpec {
    pub fn new(name: &str, agents: Vec<String>, duration_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            agents,
            duration_secs,
            checkpoint_secs: default_checkpoint_secs(),
        }
    }
}

/// The fixed, ordered phase sequence.
///
/// The workflow holds exactly one current phase at a time, and every current
/// phase must belong to this plan. The phase after the last one is the
/// implicit terminal "complete" state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhasePlan {
    pub phases: Vec<PhaseSpec>,
}

impl PhasePlan {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { phases }
    }

    /// Get a phase by name.
    pub fn get(&self, name: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Zero-based position of a phase in the sequence.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// The phase that follows `name`, or None when `name` is terminal.
    pub fn next_after(&self, name: &str) -> Option<&PhaseSpec> {
        let idx = self.position(name)?;
        self.phases.get(idx + 1)
    }

    /// Whether `name` is the last phase of the sequence.
    pub fn is_terminal(&self, name: &str) -> bool {
        self.position(name)
            .is_some_and(|idx| idx + 1 == self.phases.len())
    }

    pub fn first(&self) -> Option<&PhaseSpec> {
        self.phases.first()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self::new(vec![
            PhaseSpec::new("discovery", vec!["researcher".into()], 1800),
            PhaseSpec::new("planning", vec!["planner".into()], 1800),
            PhaseSpec::new(
                "implementation",
                vec!["builder".into(), "reviewer".into()],
                7200,
            ),
            PhaseSpec::new("validation", vec!["tester".into()], 3600),
            PhaseSpec::new("release", vec!["publisher".into()], 900),
        ])
    }
}
