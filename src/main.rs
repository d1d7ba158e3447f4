use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use modegate::commands;
use modegate::commands::autopilot::AutopilotCommand;
use modegate::commands::hooks::{HookArgs, HooksCommand};
use modegate::commands::mode::{CancelArgs, ModeCommand};
use modegate::commands::pipeline::PipelineCommand;
use modegate::commands::ralph::RalphCommand;
use modegate::commands::status::{RailsArgs, StatusArgs};
use modegate::commands::swarm::SwarmCommand;
use modegate::commands::team::TeamCommand;
use modegate::error::ExitError;
use modegate::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "modegate",
    version,
    about = "Mode orchestration and safety rails for autonomous coding agent sessions"
)]
struct Cli {
    /// Project root directory (defaults to the current directory)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Handle one agent host hook event (reads JSON on stdin)
    Hook(HookArgs),
    /// Manage hook registrations (install, audit)
    Hooks {
        #[command(subcommand)]
        command: HooksCommand,
    },
    /// Activate, deactivate and inspect modes
    Mode {
        #[command(subcommand)]
        command: ModeCommand,
    },
    /// Cancel a mode, or every active mode
    Cancel(CancelArgs),
    /// Persistent retry loop on one task
    Ralph {
        #[command(subcommand)]
        command: RalphCommand,
    },
    /// Plan, implement, verify and review
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommand,
    },
    /// Work through a task queue
    Autopilot {
        #[command(subcommand)]
        command: AutopilotCommand,
    },
    /// Run independent tasks with bounded concurrency
    Swarm {
        #[command(subcommand)]
        command: SwarmCommand,
    },
    /// Coordinate workers in separate worktrees
    Team {
        #[command(subcommand)]
        command: TeamCommand,
    },
    /// Show active modes and their documents
    Status(StatusArgs),
    /// Show circuit breaker counters and the trust level
    Rails(RailsArgs),
    /// Print the JSON Schema for .modegate.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Hook(_) => "hook",
            Self::Hooks { .. } => "hooks",
            Self::Mode { .. } => "mode",
            Self::Cancel(_) => "cancel",
            Self::Ralph { .. } => "ralph",
            Self::Pipeline { .. } => "pipeline",
            Self::Autopilot { .. } => "autopilot",
            Self::Swarm { .. } => "swarm",
            Self::Team { .. } => "team",
            Self::Status(_) => "status",
            Self::Rails(_) => "rails",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let root = cli.project_root.as_deref();
    let result = match cli.command {
        Commands::Hook(args) => args.execute(root),
        Commands::Hooks { command } => command.execute(root),
        Commands::Mode { command } => command.execute(root),
        Commands::Cancel(args) => args.execute(root),
        Commands::Ralph { command } => command.execute(root),
        Commands::Pipeline { command } => command.execute(root),
        Commands::Autopilot { command } => command.execute(root),
        Commands::Swarm { command } => command.execute(root),
        Commands::Team { command } => command.execute(root),
        Commands::Status(args) => args.execute(root),
        Commands::Rails(args) => args.execute(root),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
