use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Subcommand};

use super::{OutputFormat, Workspace};
use crate::error::ExitError;
use crate::modes::registry::{self, ActivationResult, ModeHistoryEntry};
use crate::modes::{self, Mode, ModeOutcome};

#[derive(Debug, Subcommand)]
pub enum ModeCommand {
    /// Claim the registry slot for a mode without a state machine (qa, ralplan)
    Activate {
        #[arg(value_enum)]
        mode: Mode,
        /// What the mode is for
        #[arg(long)]
        goal: Option<String>,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Release a mode and record how it ended
    Deactivate {
        #[arg(value_enum)]
        mode: Mode,
        #[arg(long, value_enum, default_value_t = ModeOutcome::Success)]
        outcome: ModeOutcome,
        /// Block reactivation for a short cooldown
        #[arg(long)]
        cooldown: bool,
    },
    /// Show recently finished modes
    History {
        /// Number of entries to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl ModeCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let now = Utc::now();
        match self {
            ModeCommand::Activate { mode, goal, format } => {
                if mode.has_document() {
                    return Err(ExitError::Rejected(format!(
                        "{mode} has its own state machine, use `modegate {mode} start`"
                    ))
                    .into());
                }
                let result = registry::activate(&ws.store, *mode, goal.as_deref(), now)?;
                let summary = ActivationResult::from(&result);
                match OutputFormat::resolve(*format) {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&summary)?);
                    }
                    OutputFormat::Pretty | OutputFormat::Text => match &result {
                        Ok(_) => println!("{mode} active"),
                        Err(e) => eprintln!("{e}"),
                    },
                }
                result
                    .map(|_| ())
                    .map_err(|e| ExitError::Rejected(e.to_string()).into())
            }
            ModeCommand::Deactivate {
                mode,
                outcome,
                cooldown,
            } => {
                if modes::halt_mode(&ws.store, *mode, *outcome, *cooldown, now)? {
                    println!("{mode} deactivated ({outcome})");
                } else {
                    println!("{mode} was not active");
                }
                Ok(())
            }
            ModeCommand::History { limit, format } => {
                let reg = registry::load(&ws.store)?;
                let skip = reg.history.len().saturating_sub(*limit);
                let entries = &reg.history[skip..];
                OutputFormat::resolve(*format).print(&history_report(entries), &entries)
            }
        }
    }
}

fn history_report(entries: &[ModeHistoryEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Mode history");
    let _ = writeln!(out);
    if entries.is_empty() {
        let _ = writeln!(out, "No mode has finished yet.");
        return out;
    }
    let _ = writeln!(out, "| Mode | Outcome | Started | Ended | Goal |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    for e in entries.iter().rev() {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {} |",
            e.mode,
            e.outcome,
            e.activated_at.format("%Y-%m-%d %H:%M"),
            e.deactivated_at.format("%Y-%m-%d %H:%M"),
            e.goal.as_deref().unwrap_or("")
        );
    }
    out
}

/// Cancel one mode, or every active mode.
#[derive(Debug, Args)]
pub struct CancelArgs {
    #[arg(value_enum)]
    pub mode: Option<Mode>,
}

impl CancelArgs {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let now = Utc::now();
        let targets: Vec<Mode> = match self.mode {
            Some(mode) => vec![mode],
            None => registry::load(&ws.store)?
                .active_modes()
                .into_iter()
                .map(|r| r.name)
                .collect(),
        };

        let mut cancelled = Vec::new();
        for mode in targets {
            if modes::halt_mode(&ws.store, mode, ModeOutcome::Cancelled, true, now)? {
                cancelled.push(mode);
            }
        }
        if cancelled.is_empty() {
            println!("nothing to cancel");
        } else {
            for mode in &cancelled {
                println!(
                    "{mode} cancelled; reactivation blocked for {}s",
                    registry::COOLDOWN_TTL_MS / 1000
                );
            }
        }
        Ok(())
    }
}
