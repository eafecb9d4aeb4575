//! The phase state machine.
//!
//! Drives the workflow through the fixed ordered phase plan. Each started
//! phase arms a single timeout equal to its duration budget; when the budget
//! is exhausted the phase is forcibly completed. Starting a new phase always
//! supersedes the previous timeout, so at most one armed timeout can ever
//! force a transition.
//!
//! Supersession uses a generation counter in addition to task aborts: a
//! timeout that is already firing may be the very task calling
//! `complete_phase`, so it cannot be aborted away; instead it validates its
//! generation under the state lock and becomes a no-op when stale.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::PhaseError;
use crate::phase::PhasePlan;
use crate::queue::{Priority, TaskOperation, TaskQueue};
use crate::state::{PersistedStateStore, StateUpdate, WorkflowStatus};

struct ActivePhase {
    name: String,
    started_at: Instant,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Progress report for the active phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseInfo {
    pub name: String,
    pub progress_percent: u8,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub agents: Vec<String>,
}

/// Sequences phases, arms their timeouts, and persists transitions.
pub struct PhaseMachine {
    plan: PhasePlan,
    store: Arc<PersistedStateStore>,
    queue: Arc<Mutex<TaskQueue>>,
    active: Mutex<Option<ActivePhase>>,
    generation: AtomicU64,
    auto_transition: AtomicBool,
}

impl PhaseMachine {
    pub fn new(
        plan: PhasePlan,
        store: Arc<PersistedStateStore>,
        queue: Arc<Mutex<TaskQueue>>,
    ) -> Self {
        Self {
            plan,
            store,
            queue,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            auto_transition: AtomicBool::new(false),
        }
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn store(&self) -> &Arc<PersistedStateStore> {
        &self.store
    }

    /// Whether the scheduler may force-complete a phase at 100% progress.
    pub fn auto_transition(&self) -> bool {
        self.auto_transition.load(Ordering::SeqCst)
    }

    pub fn set_auto_transition(&self, enabled: bool) {
        info!(enabled, "auto-transition policy changed");
        self.auto_transition.store(enabled, Ordering::SeqCst);
    }

    /// Start the named phase.
    ///
    /// Supersedes any previously armed timeout, persists the transition,
    /// enqueues a high-priority activation task per assigned agent, and arms
    /// this phase's timeout.
    pub async fn start_phase(self: &Arc<Self>, name: &str) -> Result<(), PhaseError> {
        let spec = self
            .plan
            .get(name)
            .ok_or_else(|| PhaseError::UnknownPhase {
                name: name.to_string(),
            })?
            .clone();

        let generation = {
            let mut active = self.active.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(previous) = active.take() {
                debug!(phase = %previous.name, "superseding armed phase timeout");
                if let Some(timer) = previous.timer {
                    timer.abort();
                }
            }
            *active = Some(ActivePhase {
                name: spec.name.clone(),
                started_at: Instant::now(),
                generation,
                timer: None,
            });
            generation
        };

        let next = self.plan.next_after(name).map(|p| p.name.clone());
        info!(phase = %spec.name, next = next.as_deref().unwrap_or("(terminal)"), "phase started");
        self.store
            .update(
                StateUpdate::default()
                    .current_phase(&spec.name)
                    .next_phase(next)
                    .status(WorkflowStatus::Running)
                    .progress_percent(0)
                    .note("phase started"),
            )
            .await?;

        {
            let mut queue = self.queue.lock().await;
            for agent in &spec.agents {
                queue.add_task(
                    TaskOperation::ActivateAgent {
                        agent: agent.clone(),
                    },
                    Priority::High,
                );
            }
        }

        self.arm_timeout(generation, Duration::from_secs(spec.duration_secs))
            .await;
        Ok(())
    }

    /// Complete the active phase and start its successor, or mark the
    /// workflow complete when the phase is terminal.
    ///
    /// Returns the name of the started successor, or None on completion.
    pub async fn complete_phase(self: &Arc<Self>) -> Result<Option<String>, PhaseError> {
        self.finish(None).await
    }

    /// Progress report for the active phase.
    pub async fn get_current_phase_info(&self) -> Result<PhaseInfo, PhaseError> {
        let active = self.active.lock().await;
        let active = active.as_ref().ok_or(PhaseError::NoActivePhase)?;
        Ok(self.info_for(active))
    }

    /// One main-loop tick: refresh persisted progress and, under the
    /// auto-transition policy, force completion at 100%.
    ///
    /// Returns true when the tick completed a phase. A tick with no active
    /// phase is a no-op.
    pub async fn tick(self: &Arc<Self>) -> Result<bool, PhaseError> {
        let (info, generation) = {
            let active = self.active.lock().await;
            match active.as_ref() {
                Some(active) => (self.info_for(active), active.generation),
                None => return Ok(false),
            }
        };

        self.store
            .update(
                StateUpdate::default()
                    .progress_percent(info.progress_percent)
                    .note(format!("progress refreshed for phase {}", info.name)),
            )
            .await?;

        if self.auto_transition() && info.progress_percent >= 100 {
            // The generation guard loses gracefully to a racing timeout
            match self.finish(Some(generation)).await? {
                Some(_) => return Ok(true),
                None => {
                    // Either terminal completion or a superseded observation
                    let active = self.active.lock().await;
                    return Ok(active.is_none());
                }
            }
        }
        Ok(false)
    }

    fn info_for(&self, active: &ActivePhase) -> PhaseInfo {
        let spec = self.plan.get(&active.name);
        let budget = spec.map(|s| s.duration_secs).unwrap_or(0);
        let elapsed = active.started_at.elapsed().as_secs();
        let progress = if budget == 0 {
            100
        } else {
            ((elapsed * 100) / budget).min(100) as u8
        };
        PhaseInfo {
            name: active.name.clone(),
            progress_percent: progress,
            elapsed_secs: elapsed,
            remaining_secs: budget.saturating_sub(elapsed),
            agents: spec.map(|s| s.agents.clone()).unwrap_or_default(),
        }
    }

    /// Arm the phase timeout. The handle is only stored while the phase it
    /// belongs to is still current.
    async fn arm_timeout(self: &Arc<Self>, generation: u64, budget: Duration) {
        let machine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            debug!(generation, "phase duration budget exhausted");
            match machine.finish(Some(generation)).await {
                Ok(Some(next)) => info!(next = %next, "timeout forced phase transition"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "timeout-forced completion failed"),
            }
        });

        let mut active = self.active.lock().await;
        match active.as_mut() {
            Some(active) if active.generation == generation => active.timer = Some(handle),
            // Superseded, or the timeout already fired and is driving the
            // next transition. Never abort it: the generation guard makes a
            // stale timer a no-op, while an abort could kill an in-flight
            // transition on that task.
            _ => drop(handle),
        }
    }

    /// The single completion path.
    ///
    /// `expected_generation` is set by timeout and tick callers: when the
    /// active phase has been superseded since they observed it, the call is
    /// a silent no-op. A direct `complete_phase` has no expectation and
    /// errors when no phase is active.
    fn finish<'a>(
        self: &'a Arc<Self>,
        expected_generation: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, PhaseError>> + Send + 'a>> {
        Box::pin(async move {
        let finished = {
            let mut active = self.active.lock().await;
            let current = match active.as_ref() {
                Some(current) => current,
                None => {
                    return match expected_generation {
                        Some(_) => Ok(None),
                        None => Err(PhaseError::NoActivePhase),
                    };
                }
            };
            if let Some(expected) = expected_generation {
                if current.generation != expected {
                    return Ok(None);
                }
            }
            // Supersede any still-armed timeout. Never abort here: this call
            // may itself be running on the timeout task.
            self.generation.fetch_add(1, Ordering::SeqCst);
            active.take()
        };
        let Some(finished) = finished else {
            return Err(PhaseError::NoActivePhase);
        };

        let elapsed = finished.started_at.elapsed().as_secs();
        let next = if self.plan.is_terminal(&finished.name) {
            None
        } else {
            self.plan.next_after(&finished.name).map(|p| p.name.clone())
        };
        match next {
            Some(next) => {
                self.store
                    .update(StateUpdate::default().note(format!(
                        "phase {} completed after {elapsed}s",
                        finished.name
                    )))
                    .await?;
                self.start_phase(&next).await?;
                Ok(Some(next))
            }
            None => {
                info!(phase = %finished.name, elapsed, "workflow complete");
                self.store
                    .update(
                        StateUpdate::default()
                            .status(WorkflowStatus::Complete)
                            .progress_percent(100)
                            .next_phase(None)
                            .note(format!(
                                "phase {} completed after {elapsed}s, workflow complete",
                                finished.name
                            )),
                    )
                    .await?;
                Ok(None)
            }
        }
        })
    }
}
