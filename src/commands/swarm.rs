use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;

use super::{OutputFormat, Workspace, activated, applied};
use crate::error::ExitError;
use crate::modes::registry::Activation;
use crate::modes::swarm::SwarmState;
use crate::modes::{self, ModeDocument, start_document, transition};

#[derive(Debug, Subcommand)]
pub enum SwarmCommand {
    /// Start a pool of independent tasks
    Start {
        /// A task; repeat for several
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,
        /// Tasks in flight at once
        #[arg(long)]
        concurrency: Option<u32>,
    },
    /// Assign pending tasks to every free slot
    Claim,
    /// Mark an assigned task done
    Complete {
        id: String,
        #[arg(long)]
        result: Option<String>,
    },
    /// Mark an assigned task failed
    Fail {
        id: String,
        #[arg(long)]
        error: String,
    },
    /// Show the pool
    Status {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl SwarmCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let store = &ws.store;
        let now = Utc::now();
        match self {
            SwarmCommand::Start { tasks, concurrency } => {
                if tasks.iter().all(|t| t.trim().is_empty()) {
                    return Err(ExitError::Rejected("no tasks to run".into()).into());
                }
                let concurrency = concurrency.unwrap_or(ws.config.swarm.concurrency);
                let doc = SwarmState::new(tasks, concurrency, now);
                let (doc, activation) = activated(start_document(store, doc, None, now))?;
                if activation == Activation::AlreadyActive {
                    println!("swarm is already running: {}", doc.status_line());
                    return Ok(());
                }
                applied(transition(store, now, |s: &mut SwarmState| s.fill_slots(now)))?;
                let doc: SwarmState = modes::load_document(store)?;
                println!("{}", doc.context_block()?);
            }
            SwarmCommand::Claim => {
                let ids = applied(transition(store, now, |s: &mut SwarmState| s.fill_slots(now)))?;
                if ids.is_empty() {
                    println!("no free slots or no pending tasks");
                } else {
                    let doc: SwarmState = modes::load_document(store)?;
                    for task in doc.tasks.iter().filter(|t| ids.contains(&t.id)) {
                        println!("{}: {}", task.id, task.description);
                    }
                }
            }
            SwarmCommand::Complete { id, result } => {
                applied(transition(store, now, |s: &mut SwarmState| {
                    s.complete_task(id, result.as_deref(), now)
                }))?;
                println!("{id} done");
            }
            SwarmCommand::Fail { id, error } => {
                applied(transition(store, now, |s: &mut SwarmState| {
                    s.fail_task(id, error, now)
                }))?;
                println!("{id} failed");
            }
            SwarmCommand::Status { format } => {
                let doc: SwarmState = modes::load_document(store)?;
                OutputFormat::resolve(*format).print(&doc.status_report(), &doc)?;
            }
        }
        Ok(())
    }
}
