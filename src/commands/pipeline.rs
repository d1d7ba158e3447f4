use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Subcommand;

use super::{OutputFormat, Workspace, activated, applied, read_text_arg};
use crate::modes::pipeline::{self, GateRun, PipelineState, VerifyOutcome};
use crate::modes::registry::Activation;
use crate::modes::{self, ModeDocument, start_document, transition};
use crate::subprocess::ShellRunner;

#[derive(Debug, Subcommand)]
pub enum PipelineCommand {
    /// Start a plan → implement → verify → review pipeline
    Start {
        goal: String,
        /// Failed verifications tolerated before the pipeline fails
        #[arg(long)]
        max_fix_attempts: Option<u32>,
    },
    /// Record the plan (use `-` to read it from stdin) and start implementing
    Plan { text: String },
    /// Move to the next stage
    Advance,
    /// Run the configured gates now
    Verify,
    /// Show the pipeline's state
    Status {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl PipelineCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let ws = Workspace::open(project_root)?;
        let store = &ws.store;
        let now = Utc::now();
        match self {
            PipelineCommand::Start {
                goal,
                max_fix_attempts,
            } => {
                let max = max_fix_attempts.unwrap_or(ws.config.pipeline.max_fix_attempts);
                let doc = PipelineState::new(goal, max, now);
                let (doc, activation) = activated(start_document(store, doc, Some(goal), now))?;
                if activation == Activation::AlreadyActive {
                    println!("pipeline is already running: {}", doc.status_line());
                    return Ok(());
                }
                println!("{}", doc.context_block()?);
            }
            PipelineCommand::Plan { text } => {
                let plan = read_text_arg(text)?;
                applied(transition(store, now, |p: &mut PipelineState| {
                    p.record_plan(&plan, now)
                }))?;
                let doc: PipelineState = modes::load_document(store)?;
                println!("{}", doc.context_block()?);
            }
            PipelineCommand::Advance => {
                let stage = applied(transition(store, now, |p: &mut PipelineState| {
                    p.advance_stage(now)
                }))?;
                println!("pipeline moved to {}", stage.as_str());
            }
            PipelineCommand::Verify => {
                let run = GateRun {
                    gates: &ws.config.pipeline.gates,
                    runner: &ShellRunner,
                    cwd: &ws.root,
                    timeout: Duration::from_secs(ws.config.pipeline.gate_timeout_secs),
                };
                let outcome = applied(pipeline::verify(store, &run, now))?;
                let doc: PipelineState = modes::load_document(store)?;
                if let Some(result) = doc.last_verification() {
                    for gate in &result.gates {
                        let mark = if gate.passed { "PASS" } else { "FAIL" };
                        let kind = if gate.blocking { "" } else { " (advisory)" };
                        println!("{mark} {}{kind}: {}", gate.label, gate.command);
                    }
                    if let Some(note) = &result.note {
                        println!("{note}");
                    }
                }
                match outcome {
                    VerifyOutcome::Passed => println!("verification passed, moving to review"),
                    VerifyOutcome::Fixing { attempt } => println!(
                        "verification failed, fix attempt {attempt} of {}",
                        doc.max_fix_attempts
                    ),
                    VerifyOutcome::Exhausted => {
                        println!("verification failed, fix attempts exhausted; pipeline failed");
                    }
                }
            }
            PipelineCommand::Status { format } => {
                let doc: PipelineState = modes::load_document(store)?;
                OutputFormat::resolve(*format).print(&doc.status_report(), &doc)?;
            }
        }
        Ok(())
    }
}
