//! The built-in command agent.
//!
//! Runs a configured shell command as the agent's unit of work. The registry
//! only sees the `AgentExecutor` surface; what the command actually does is
//! opaque to the orchestration core.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::AgentDefinition;
use crate::registry::AgentExecutor;

/// An agent whose work is a shell command.
pub struct CommandAgent {
    name: String,
    command: String,
    restart_command: Option<String>,
    timeout: Duration,
    working_dir: PathBuf,
}

impl CommandAgent {
    pub fn new(definition: &AgentDefinition, working_dir: PathBuf) -> Self {
        Self {
            name: definition.name.clone(),
            command: definition.command.clone(),
            restart_command: definition.restart_command.clone(),
            timeout: Duration::from_secs(definition.timeout_secs),
            working_dir,
        }
    }

    /// Run a command through the shell, bounded by the configured timeout.
    /// A nonzero exit status or a timeout is a failure.
    async fn run(&self, command: &str) -> Result<()> {
        debug!(agent = %self.name, command, "running agent command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CONDUCTOR_AGENT", &self.name)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command: {command}"))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for agent command")?,
            Err(_) => {
                bail!(
                    "Agent '{}' timed out after {} seconds",
                    self.name,
                    self.timeout.as_secs()
                );
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Agent '{}' exited with {} ({})",
                self.name,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentExecutor for CommandAgent {
    async fn execute(&self) -> Result<()> {
        self.run(&self.command).await
    }

    /// Restart runs the dedicated restart command when one is configured,
    /// otherwise re-runs the main command.
    async fn restart(&self) -> Result<()> {
        let command = self.restart_command.as_deref().unwrap_or(&self.command);
        self.run(command).await
    }
}
