use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;

use super::{OutputFormat, Workspace, activated, applied};
use crate::error::TransitionError;
use crate::modes::registry::Activation;
use crate::modes::team::{self, MergePlan, TeamState, WorkerStatus, WorkerUpdate};
use crate::modes::{self, ModeDocument, start_document, transition};
use crate::vcs::GitInspector;

#[derive(Debug, Subcommand)]
pub enum TeamCommand {
    /// Lay out a team of workers, one worktree each
    Start {
        session: String,
        task: String,
        #[arg(long)]
        workers: Option<u32>,
        /// Branch the workers start from and merge back into
        #[arg(long)]
        base: Option<String>,
    },
    /// Report a worker's progress
    Update {
        id: String,
        #[arg(long, value_enum)]
        status: Option<WorkerStatus>,
        /// A file the worker changed; repeat for several
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Show the merge order, overlapping files and merge commands
    Plan {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
    /// Show the team's state
    Status {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl TeamCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let store = &ws.store;
        let now = Utc::now();
        match self {
            TeamCommand::Start {
                session,
                task,
                workers,
                base,
            } => {
                let count = workers.unwrap_or(ws.config.team.workers);
                let base = base.as_deref().unwrap_or(&ws.config.team.base_branch);
                let doc = applied(Ok(team::create_team_state(session, base, task, count, now)))?;
                let (doc, activation) = activated(start_document(store, doc, Some(task), now))?;
                if activation == Activation::AlreadyActive {
                    println!("a team is already running: {}", doc.status_line());
                    return Ok(());
                }
                println!("{}", doc.context_block()?);
            }
            TeamCommand::Update { id, status, files } => {
                let update = WorkerUpdate {
                    status: *status,
                    modified_files: (!files.is_empty()).then(|| files.clone()),
                    completed_at: None,
                };
                applied(transition(store, now, |t: &mut TeamState| {
                    if !t.active {
                        return Err(TransitionError::NotActive { mode: "team" });
                    }
                    if t.update_worker(id, &update, now) {
                        Ok(())
                    } else {
                        Err(TransitionError::UnknownId {
                            kind: "worker",
                            id: id.clone(),
                        })
                    }
                }))?;
                let doc: TeamState = modes::load_document(store)?;
                println!("{}", doc.status_line());
            }
            TeamCommand::Plan { format } => {
                let doc: TeamState = modes::load_document(store)?;
                let plan = doc.merge_plan(&GitInspector::new(&ws.root));
                OutputFormat::resolve(*format).print(&plan_report(&doc, &plan), &plan)?;
            }
            TeamCommand::Status { format } => {
                let doc: TeamState = modes::load_document(store)?;
                OutputFormat::resolve(*format).print(&doc.status_report(), &doc)?;
            }
        }
        Ok(())
    }
}

fn plan_report(team: &TeamState, plan: &MergePlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Merge plan for {}", team.session_name);
    let _ = writeln!(out);
    if plan.order.is_empty() {
        let _ = writeln!(out, "No worker has finished with changes to merge.");
    } else {
        let _ = writeln!(out, "## Order");
        let _ = writeln!(out);
        for (i, c) in plan.order.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}. {} (`{}`, {} file(s))",
                i + 1,
                c.worker,
                c.branch,
                c.changed_files
            );
        }
        let _ = writeln!(out);
    }
    if !plan.overlaps.is_empty() {
        let _ = writeln!(out, "## Overlapping files");
        let _ = writeln!(out);
        for o in &plan.overlaps {
            let _ = writeln!(out, "- `{}`: {}", o.path, o.workers.join(", "));
        }
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "## Commands");
    let _ = writeln!(out);
    let _ = writeln!(out, "```");
    for step in &plan.steps {
        let _ = writeln!(out, "{step}");
    }
    let _ = writeln!(out, "```");
    out
}
