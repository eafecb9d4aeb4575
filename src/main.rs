use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use conductor::config::Config;

mod cmd;

use cmd::{CommandOutcome, Runtime};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-agent workflow orchestration daemon")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the named phase
    Start { phase: String },
    /// Aggregate daemon, agent, task, and phase report
    Status,
    /// Phase state machine operations
    Phase {
        #[command(subcommand)]
        command: PhaseCommands,
    },
    /// Agent registry operations
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Scheduler daemon control
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Check that the workflow document has all required sections
    Validate,
    /// Workflow document snapshots
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Run every phase to completion unattended
    Auto,
}

#[derive(Subcommand)]
pub enum PhaseCommands {
    Start { name: String },
    Complete,
    Info,
    /// Toggle the auto-transition policy
    Auto { enabled: bool },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    Activate { name: String },
    List,
    Health { name: Option<String> },
}

#[derive(Subcommand)]
pub enum DaemonCommands {
    /// Run the scheduler in the foreground until interrupted
    Start,
    /// Request shutdown of a running daemon
    Stop,
    Status,
}

#[derive(Subcommand)]
pub enum BackupCommands {
    Create,
    List,
    Restore { name: String },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("conductor={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose)?;
    let runtime = Runtime::new(config).await?;

    let outcome = match &cli.command {
        Commands::Start { phase } => cmd::cmd_start(&runtime, phase).await,
        Commands::Status => cmd::cmd_status(&runtime).await,
        Commands::Phase { command } => match command {
            PhaseCommands::Start { name } => cmd::cmd_start(&runtime, name).await,
            PhaseCommands::Complete => cmd::cmd_phase_complete(&runtime).await,
            PhaseCommands::Info => cmd::cmd_phase_info(&runtime).await,
            PhaseCommands::Auto { enabled } => cmd::cmd_phase_auto(&runtime, *enabled).await,
        },
        Commands::Agent { command } => match command {
            AgentCommands::Activate { name } => cmd::cmd_agent_activate(&runtime, name).await,
            AgentCommands::List => cmd::cmd_agent_list(&runtime).await,
            AgentCommands::Health { name } => {
                cmd::cmd_agent_health(&runtime, name.as_deref()).await
            }
        },
        Commands::Daemon { command } => match command {
            DaemonCommands::Start => cmd::cmd_daemon_start(&runtime).await?,
            DaemonCommands::Stop => cmd::cmd_daemon_stop(&runtime),
            DaemonCommands::Status => cmd::cmd_daemon_status(&runtime).await,
        },
        Commands::Validate => cmd::cmd_validate(&runtime).await,
        Commands::Backup { command } => match command {
            BackupCommands::Create => cmd::cmd_backup_create(&runtime).await,
            BackupCommands::List => cmd::cmd_backup_list(&runtime),
            BackupCommands::Restore { name } => cmd::cmd_backup_restore(&runtime, name).await,
        },
        Commands::Auto => cmd::cmd_auto(&runtime).await?,
    };

    render(&outcome)?;
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}

fn render(outcome: &CommandOutcome) -> Result<()> {
    let json =
        serde_json::to_string_pretty(outcome).context("Failed to serialize command outcome")?;
    println!("{json}");
    Ok(())
}
