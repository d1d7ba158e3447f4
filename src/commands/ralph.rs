use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;

use super::{OutputFormat, Workspace, activated, applied};
use crate::modes::ralph::RalphState;
use crate::modes::registry::Activation;
use crate::modes::{self, ModeDocument, start_document, transition};

#[derive(Debug, Subcommand)]
pub enum RalphCommand {
    /// Start a persistent retry loop on a task
    Start {
        task: String,
        /// Iterations before the loop gives up
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Record a failed attempt
    Fail {
        #[arg(long)]
        reason: String,
    },
    /// Remember an approach that was tried
    Approach { text: String },
    /// Mark the task as done and end the loop
    Complete,
    /// Show the loop's state
    Status {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl RalphCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let store = &ws.store;
        let now = Utc::now();
        match self {
            RalphCommand::Start {
                task,
                max_iterations,
            } => {
                let max = max_iterations.unwrap_or(ws.config.ralph.max_iterations);
                let doc = RalphState::new(task, max, now);
                let (_, activation) = activated(start_document(store, doc, Some(task), now))?;
                if activation == Activation::AlreadyActive {
                    let current: RalphState = modes::load_document(store)?;
                    println!("ralph is already running: {}", current.status_line());
                    return Ok(());
                }
                applied(transition(store, now, |r: &mut RalphState| {
                    r.advance_iteration(now)
                }))?;
                let ralph: RalphState = modes::load_document(store)?;
                println!("{}", ralph.context_block()?);
            }
            RalphCommand::Fail { reason } => {
                let count = applied(transition(store, now, |r: &mut RalphState| {
                    r.record_failure(reason, now)
                }))?;
                let ralph: RalphState = modes::load_document(store)?;
                let strategy = ralph.strategy();
                println!("failure {count} recorded");
                println!("[{}] {}", strategy.tier.label(), strategy.guidance);
            }
            RalphCommand::Approach { text } => {
                applied(transition(store, now, |r: &mut RalphState| {
                    r.record_approach(text, now)
                }))?;
                println!("approach recorded");
            }
            RalphCommand::Complete => {
                applied(transition(store, now, |r: &mut RalphState| r.record_success(now)))?;
                let ralph: RalphState = modes::load_document(store)?;
                println!("ralph succeeded after {} iteration(s)", ralph.iteration);
            }
            RalphCommand::Status { format } => {
                let ralph: RalphState = modes::load_document(store)?;
                OutputFormat::resolve(*format).print(&ralph.status_report(), &ralph)?;
            }
        }
        Ok(())
    }
}
