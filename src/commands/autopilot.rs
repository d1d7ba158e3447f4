use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;

use super::{OutputFormat, Workspace, activated, applied};
use crate::error::ExitError;
use crate::heuristics::extract_tasks;
use crate::modes::autopilot::AutopilotState;
use crate::modes::registry::Activation;
use crate::modes::{self, ModeDocument, start_document, transition};

#[derive(Debug, Subcommand)]
pub enum AutopilotCommand {
    /// Queue tasks and start working through them
    Start {
        /// A task; repeat for several
        #[arg(long = "task", conflicts_with = "plan_file")]
        tasks: Vec<String>,
        /// Markdown plan to extract tasks from
        #[arg(long)]
        plan_file: Option<PathBuf>,
        #[arg(long)]
        max_failures: Option<u32>,
        /// Pause for review after this many completed tasks
        #[arg(long)]
        review_every: Option<u32>,
    },
    /// Start the next pending task
    Next,
    /// Mark the current task done
    Done,
    /// Mark the current task failed
    Fail {
        #[arg(long)]
        error: String,
    },
    /// Skip a pending task, or the current one
    Skip { id: Option<String> },
    /// Continue after a review checkpoint
    Resume,
    /// Show the queue
    Status {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl AutopilotCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let store = &ws.store;
        let now = Utc::now();
        match self {
            AutopilotCommand::Start {
                tasks,
                plan_file,
                max_failures,
                review_every,
            } => {
                let descriptions = match plan_file {
                    Some(path) => {
                        let plan = std::fs::read_to_string(path)
                            .with_context(|| format!("reading {}", path.display()))?;
                        extract_tasks(&plan)
                    }
                    None => tasks.clone(),
                };
                if descriptions.is_empty() {
                    return Err(ExitError::Rejected("no tasks to run".into()).into());
                }
                let doc = AutopilotState::new(
                    &descriptions,
                    max_failures.unwrap_or(ws.config.autopilot.max_consecutive_failures),
                    review_every.unwrap_or(ws.config.autopilot.max_tasks_before_review),
                    now,
                );
                let (doc, activation) = activated(start_document(store, doc, None, now))?;
                if activation == Activation::AlreadyActive {
                    println!("autopilot is already running: {}", doc.status_line());
                    return Ok(());
                }
                applied(transition(store, now, |a: &mut AutopilotState| {
                    a.start_next_task(now)
                }))?;
                let doc: AutopilotState = modes::load_document(store)?;
                println!("queued {} task(s)", doc.tasks.len());
                println!("{}", doc.context_block()?);
            }
            AutopilotCommand::Next => {
                match applied(transition(store, now, |a: &mut AutopilotState| {
                    a.start_next_task(now)
                }))? {
                    Some(id) => {
                        let doc: AutopilotState = modes::load_document(store)?;
                        if let Some(task) = doc.current_task() {
                            println!("{id}: {}", task.description);
                        }
                    }
                    None => println!("no pending tasks"),
                }
            }
            AutopilotCommand::Done => {
                let id = applied(transition(store, now, |a: &mut AutopilotState| {
                    a.complete_current_task(now)
                }))?;
                println!("{id} done");
            }
            AutopilotCommand::Fail { error } => {
                let (id, aborted) = applied(transition(store, now, |a: &mut AutopilotState| {
                    let id = a.fail_current_task(error, now)?;
                    let abort = a.should_abort();
                    if abort {
                        a.abort(now);
                    }
                    Ok((id, abort))
                }))?;
                println!("{id} failed");
                if aborted {
                    println!("too many consecutive failures, autopilot aborted");
                }
            }
            AutopilotCommand::Skip { id } => {
                let skipped = applied(transition(store, now, |a: &mut AutopilotState| {
                    a.skip_task(id.as_deref(), now)
                }))?;
                println!("{skipped} skipped");
            }
            AutopilotCommand::Resume => {
                applied(transition(store, now, |a: &mut AutopilotState| {
                    a.reset_review_counter(now)
                }))?;
                println!("review checkpoint cleared");
            }
            AutopilotCommand::Status { format } => {
                let doc: AutopilotState = modes::load_document(store)?;
                OutputFormat::resolve(*format).print(&doc.status_report(), &doc)?;
            }
        }
        Ok(())
    }
}
