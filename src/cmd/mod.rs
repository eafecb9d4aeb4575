//! CLI command implementations.
//!
//! Each `cmd_*` function maps one subcommand onto one core operation and
//! returns a structured [`CommandOutcome`] for the binary to render. The
//! core components never print; rendering stays at the binary edge.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};
use tracing::info;

use conductor::agents::CommandAgent;
use conductor::config::Config;
use conductor::queue::TaskQueue;
use conductor::registry::AgentRegistry;
use conductor::scheduler::Scheduler;
use conductor::state::{PersistedStateStore, WorkflowStatus};
use conductor::workflow::PhaseMachine;

/// Structured result of one command, rendered as JSON by the binary.
#[derive(Debug, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// The composed orchestration core, one per process.
pub struct Runtime {
    pub config: Config,
    pub registry: Arc<Mutex<AgentRegistry>>,
    pub machine: Arc<PhaseMachine>,
    pub scheduler: Arc<Scheduler>,
}

impl Runtime {
    /// Wire the components together and register the configured command
    /// agents.
    pub async fn new(config: Config) -> Result<Self> {
        config
            .ensure_directories()
            .context("Failed to prepare state directories")?;

        let store = Arc::new(PersistedStateStore::new(&config));
        let queue = Arc::new(Mutex::new(TaskQueue::new()));
        let registry = Arc::new(Mutex::new(AgentRegistry::new()));
        {
            let mut registry = registry.lock().await;
            for definition in &config.agents {
                registry.register(
                    definition.name.clone(),
                    Arc::new(CommandAgent::new(definition, config.project_dir.clone())),
                );
            }
        }
        let machine = Arc::new(PhaseMachine::new(
            config.plan.clone(),
            store,
            queue.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            &config,
            machine.clone(),
            registry.clone(),
            queue.clone(),
        ));

        Ok(Self {
            config,
            registry,
            machine,
            scheduler,
        })
    }
}

pub async fn cmd_start(runtime: &Runtime, phase: &str) -> CommandOutcome {
    match runtime.machine.start_phase(phase).await {
        Ok(()) => {
            let next = runtime
                .machine
                .plan()
                .next_after(phase)
                .map(|p| p.name.clone());
            CommandOutcome::ok(json!({ "phase": phase, "next": next }))
        }
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_status(runtime: &Runtime) -> CommandOutcome {
    let daemon = runtime.scheduler.get_status().await;
    match runtime.machine.store().read().await {
        Ok(doc) => CommandOutcome::ok(json!({
            "daemon": daemon,
            "document": doc,
        })),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_phase_complete(runtime: &Runtime) -> CommandOutcome {
    match runtime.machine.complete_phase().await {
        Ok(Some(next)) => CommandOutcome::ok(json!({ "next": next })),
        Ok(None) => CommandOutcome::ok(json!({ "workflow": "complete" })),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_phase_info(runtime: &Runtime) -> CommandOutcome {
    match runtime.machine.get_current_phase_info().await {
        Ok(info) => CommandOutcome::ok(json!(info)),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_phase_auto(runtime: &Runtime, enabled: bool) -> CommandOutcome {
    runtime.machine.set_auto_transition(enabled);
    CommandOutcome::ok(json!({ "auto_transition": enabled }))
}

pub async fn cmd_agent_activate(runtime: &Runtime, name: &str) -> CommandOutcome {
    let result = runtime.registry.lock().await.activate(name).await;
    match result {
        Ok(succeeded) => CommandOutcome::ok(json!({ "agent": name, "succeeded": succeeded })),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_agent_list(runtime: &Runtime) -> CommandOutcome {
    let agents = runtime.registry.lock().await.snapshot();
    CommandOutcome::ok(json!({ "agents": agents }))
}

pub async fn cmd_agent_health(runtime: &Runtime, name: Option<&str>) -> CommandOutcome {
    let registry = runtime.registry.lock().await;
    match name {
        Some(name) if !registry.contains(name) => {
            CommandOutcome::fail(format!("Unknown agent '{name}'"))
        }
        Some(name) => CommandOutcome::ok(json!({
            "agent": name,
            "healthy": registry.is_healthy(name),
        })),
        None => {
            let agents = registry.snapshot();
            let healthy: Vec<_> = agents
                .iter()
                .map(|a| json!({ "agent": a.name, "healthy": registry.is_healthy(&a.name) }))
                .collect();
            CommandOutcome::ok(json!({ "agents": healthy }))
        }
    }
}

/// Run the scheduler in the foreground until Ctrl-C or a stop request.
pub async fn cmd_daemon_start(runtime: &Runtime) -> Result<CommandOutcome> {
    let mut shutdown = runtime.scheduler.shutdown_signal();
    runtime.scheduler.start().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = shutdown.changed() => {
            info!("stop request observed, shutting down");
        }
    }
    runtime.scheduler.stop().await;
    Ok(CommandOutcome::ok(json!({ "daemon": "stopped" })))
}

/// Request shutdown of a daemon running in another process.
pub fn cmd_daemon_stop(runtime: &Runtime) -> CommandOutcome {
    if let Some(parent) = runtime.config.stop_file.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return CommandOutcome::fail(e);
        }
    }
    match std::fs::write(&runtime.config.stop_file, b"stop\n") {
        Ok(()) => CommandOutcome::ok(json!({ "daemon": "stop requested" })),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_daemon_status(runtime: &Runtime) -> CommandOutcome {
    CommandOutcome::ok(json!(runtime.scheduler.get_status().await))
}

pub async fn cmd_validate(runtime: &Runtime) -> CommandOutcome {
    match runtime.machine.store().validate().await {
        Ok(()) => CommandOutcome::ok(json!({ "valid": true })),
        Err(e) => CommandOutcome {
            success: false,
            data: Some(json!({ "valid": false })),
            error: Some(e.to_string()),
        },
    }
}

pub async fn cmd_backup_create(runtime: &Runtime) -> CommandOutcome {
    match runtime.machine.store().create_backup().await {
        Ok(Some(name)) => CommandOutcome::ok(json!({ "created": name })),
        Ok(None) => CommandOutcome::ok(json!({ "created": null, "throttled": true })),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub fn cmd_backup_list(runtime: &Runtime) -> CommandOutcome {
    match runtime.machine.store().list_backups() {
        Ok(backups) => CommandOutcome::ok(json!({ "backups": backups })),
        Err(e) => CommandOutcome::fail(e),
    }
}

pub async fn cmd_backup_restore(runtime: &Runtime, name: &str) -> CommandOutcome {
    match runtime.machine.store().restore_backup(name).await {
        Ok(doc) => CommandOutcome::ok(json!({ "restored": name, "current_phase": doc.current_phase })),
        Err(e) => CommandOutcome::fail(e),
    }
}

/// Run every phase to completion unattended: enable auto-transition, start
/// the first phase, drive the scheduler until the document reaches
/// `complete`.
pub async fn cmd_auto(runtime: &Runtime) -> Result<CommandOutcome> {
    let Some(first) = runtime.machine.plan().first().map(|p| p.name.clone()) else {
        return Ok(CommandOutcome::fail("Phase plan is empty"));
    };

    runtime.machine.set_auto_transition(true);
    if let Err(e) = runtime.machine.start_phase(&first).await {
        return Ok(CommandOutcome::fail(e));
    }
    runtime.scheduler.start().await;

    loop {
        sleep(Duration::from_millis(500)).await;
        let doc = runtime.machine.store().read().await?;
        if doc.status == WorkflowStatus::Complete {
            break;
        }
    }
    runtime.scheduler.stop().await;

    let doc = runtime.machine.store().read().await?;
    Ok(CommandOutcome::ok(json!({
        "workflow": "complete",
        "final_phase": doc.current_phase,
    })))
}
