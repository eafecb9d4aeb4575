//! The orchestration daemon.
//!
//! Three independently cancellable periodic loops:
//! - main loop: stop-file check, progress refresh, auto-transition
//! - health loop: agent health sweep and restarts
//! - task loop: bounded-concurrency draining of the task queue
//!
//! Any error inside a single tick is logged and skipped; the loops never
//! stop on their own. `stop()` aborts the loops but in-flight task
//! executions are allowed to finish.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::queue::{QueueStats, Task, TaskOperation, TaskQueue};
use crate::registry::{AgentHealth, AgentRegistry};
use crate::workflow::{PhaseInfo, PhaseMachine};

/// Aggregate report for external status callers.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub auto_transition: bool,
    pub agents: Vec<AgentHealth>,
    pub tasks: QueueStats,
    pub phase: Option<PhaseInfo>,
}

/// Composes the machine, registry, and queue into a periodic daemon.
pub struct Scheduler {
    machine: Arc<PhaseMachine>,
    registry: Arc<Mutex<AgentRegistry>>,
    queue: Arc<Mutex<TaskQueue>>,
    main_interval: Duration,
    health_interval: Duration,
    task_interval: Duration,
    max_concurrent_tasks: usize,
    stop_file: PathBuf,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        machine: Arc<PhaseMachine>,
        registry: Arc<Mutex<AgentRegistry>>,
        queue: Arc<Mutex<TaskQueue>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            machine,
            registry,
            queue,
            main_interval: config.main_interval(),
            health_interval: config.health_interval(),
            task_interval: config.task_interval(),
            max_concurrent_tasks: config.scheduler.max_concurrent_tasks,
            stop_file: config.stop_file.clone(),
            loops: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Resolves to true once shutdown has been requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Launch the three loops. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running");
            return;
        }
        // A stop request from a previous run must not kill this one
        let _ = std::fs::remove_file(&self.stop_file);

        let mut loops = self.loops.lock().await;
        loops.push(self.spawn_loop(self.main_interval, |s| async move {
            s.main_tick().await;
        }));
        loops.push(self.spawn_loop(self.health_interval, |s| async move {
            s.health_tick().await;
        }));
        loops.push(self.spawn_loop(self.task_interval, |s| async move {
            s.drain_tasks().await;
        }));
        info!(
            main_secs = self.main_interval.as_secs(),
            health_secs = self.health_interval.as_secs(),
            task_secs = self.task_interval.as_secs(),
            "scheduler started"
        );
    }

    /// Abort the loops. Idempotent. In-flight task executions run to
    /// completion; only the periodic drivers are cancelled.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    /// Aggregate daemon, agent, task, and phase state.
    pub async fn get_status(&self) -> DaemonStatus {
        let agents = self.registry.lock().await.snapshot();
        let tasks = self.queue.lock().await.get_stats();
        let phase = self.machine.get_current_phase_info().await.ok();
        DaemonStatus {
            running: self.is_running(),
            auto_transition: self.machine.auto_transition(),
            agents,
            tasks,
            phase,
        }
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Scheduler>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                tick(Arc::clone(&scheduler)).await;
            }
        })
    }

    /// One main-loop tick: observe stop requests, refresh progress, apply
    /// the auto-transition policy.
    async fn main_tick(self: &Arc<Self>) {
        if self.stop_file.exists() {
            info!("stop requested via control file");
            let _ = std::fs::remove_file(&self.stop_file);
            let _ = self.shutdown.send(true);
            return;
        }
        if let Err(e) = self.machine.tick().await {
            warn!(error = %e, "main loop tick failed");
        }
    }

    async fn health_tick(&self) {
        self.registry.lock().await.health_check().await;
    }

    /// Pop and launch queued tasks while below the concurrency cap.
    async fn drain_tasks(self: &Arc<Self>) {
        loop {
            let task = {
                let mut queue = self.queue.lock().await;
                if queue.running_count() >= self.max_concurrent_tasks {
                    break;
                }
                match queue.get_next_task() {
                    Some(task) => {
                        queue.mark_running(task.id);
                        task
                    }
                    None => break,
                }
            };
            debug!(task_id = %task.id, "launching task");
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.execute_task(task).await;
            });
        }
    }

    /// Run one task to completion and record its outcome. Failures are
    /// absorbed into queue statistics, never propagated.
    async fn execute_task(&self, task: Task) {
        let TaskOperation::ActivateAgent { agent } = &task.operation;

        let begun = self.registry.lock().await.begin_activation(agent);
        let executor = match begun {
            Ok(Some(executor)) => executor,
            Ok(None) => {
                self.queue
                    .lock()
                    .await
                    .mark_failed(task.id, format!("agent '{agent}' not activatable"));
                return;
            }
            Err(e) => {
                self.queue.lock().await.mark_failed(task.id, e.to_string());
                return;
            }
        };

        // Executor runs without holding the registry, so up to the cap can
        // run at once
        let outcome = executor.execute().await;
        let succeeded = self
            .registry
            .lock()
            .await
            .finish_activation(agent, outcome);

        let mut queue = self.queue.lock().await;
        if succeeded {
            queue.mark_completed(task.id);
        } else {
            queue.mark_failed(task.id, format!("agent '{agent}' execution failed"));
        }
    }
}
