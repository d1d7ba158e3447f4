//! Staged quality pipeline: plan → implement → verify → fix → review → done.
//!
//! Verification runs the configured gates serially. A failed verify sends the
//! pipeline to fix, and finishing a fix always returns to verify. Once the fix
//! budget is spent, the next failure ends the pipeline.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ControlSignal, Mode, ModeDocument, ModeOutcome, load_document, render_context, transition};
use crate::config::GateConfig;
use crate::error::TransitionError;
use crate::state::{StateStore, keys};
use crate::subprocess::CommandRunner;
use crate::template::{self, ContextTemplate};

const EXCERPT_CHARS: usize = 600;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Plan,
    Implement,
    Verify,
    Fix,
    Review,
    Done,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::Plan,
        Stage::Implement,
        Stage::Verify,
        Stage::Fix,
        Stage::Review,
        Stage::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Implement => "implement",
            Stage::Verify => "verify",
            Stage::Fix => "fix",
            Stage::Review => "review",
            Stage::Done => "done",
        }
    }
}

/// The stage after `stage` in fixed order. `Done` is absorbing.
pub fn get_next_stage(stage: Stage) -> Stage {
    match stage {
        Stage::Plan => Stage::Implement,
        Stage::Implement => Stage::Verify,
        Stage::Verify => Stage::Fix,
        Stage::Fix => Stage::Review,
        Stage::Review | Stage::Done => Stage::Done,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInfo {
    pub stage: Stage,
    pub status: StageStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub label: String,
    pub command: String,
    pub blocking: bool,
    pub passed: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub stage: Stage,
    pub passed: bool,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<GateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Aborted,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub current_stage: Stage,
    #[serde(default)]
    pub stages: Vec<StageInfo>,
    #[serde(default)]
    pub fix_attempts: u32,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default)]
    pub history: Vec<StageResult>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub status: PipelineStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

fn default_max_fix_attempts() -> u32 {
    3
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            active: false,
            goal: String::new(),
            current_stage: Stage::Plan,
            stages: Vec::new(),
            fix_attempts: 0,
            max_fix_attempts: default_max_fix_attempts(),
            history: Vec::new(),
            plan: None,
            status: PipelineStatus::Running,
            started_at: None,
            last_activity_at: None,
        }
    }
}

/// What a recorded verification led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Passed,
    Fixing { attempt: u32 },
    Exhausted,
}

impl PipelineState {
    pub fn new(goal: &str, max_fix_attempts: u32, now: DateTime<Utc>) -> Self {
        let stages = Stage::ORDER
            .iter()
            .map(|&stage| StageInfo {
                stage,
                status: if stage == Stage::Plan {
                    StageStatus::InProgress
                } else {
                    StageStatus::Pending
                },
            })
            .collect();
        Self {
            active: true,
            goal: goal.to_string(),
            stages,
            max_fix_attempts,
            started_at: Some(now),
            last_activity_at: Some(now),
            ..Self::default()
        }
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if self.status != PipelineStatus::Running {
            return Err(TransitionError::Terminal {
                mode: "pipeline",
                status: self.status.as_str().to_string(),
            });
        }
        if !self.active {
            return Err(TransitionError::NotActive { mode: "pipeline" });
        }
        Ok(())
    }

    fn ensure_stage(&self, expected: Stage) -> Result<(), TransitionError> {
        self.ensure_running()?;
        if self.current_stage != expected {
            return Err(TransitionError::Invalid(format!(
                "pipeline is in {}, not {}",
                self.current_stage.as_str(),
                expected.as_str()
            )));
        }
        Ok(())
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map_or(StageStatus::Pending, |s| s.status)
    }

    fn set_stage_status(&mut self, stage: Stage, status: StageStatus) {
        match self.stages.iter_mut().find(|s| s.stage == stage) {
            Some(info) => info.status = status,
            None => self.stages.push(StageInfo { stage, status }),
        }
    }

    fn enter(&mut self, stage: Stage, now: DateTime<Utc>) {
        self.current_stage = stage;
        self.last_activity_at = Some(now);
        if stage == Stage::Done {
            self.set_stage_status(Stage::Done, StageStatus::Passed);
            self.status = PipelineStatus::Completed;
            self.active = false;
            info!(goal = %self.goal, "pipeline completed");
        } else {
            self.set_stage_status(stage, StageStatus::InProgress);
            info!(stage = stage.as_str(), "pipeline stage entered");
        }
    }

    /// Move strictly forward one stage. Verify is only left through
    /// [`Self::record_verification`]; a finished fix goes back to verify.
    pub fn advance_stage(&mut self, now: DateTime<Utc>) -> Result<Stage, TransitionError> {
        self.ensure_running()?;
        let from = self.current_stage;
        match from {
            Stage::Verify => {
                return Err(TransitionError::Invalid(
                    "verify only passes by running the gates: `modegate pipeline verify`".into(),
                ));
            }
            Stage::Fix => {
                self.complete_fix(now)?;
                return Ok(Stage::Verify);
            }
            _ => {}
        }
        let to = get_next_stage(from);
        self.set_stage_status(from, StageStatus::Passed);
        self.history.push(StageResult {
            stage: from,
            passed: true,
            at: now,
            gates: Vec::new(),
            note: None,
        });
        self.enter(to, now);
        Ok(to)
    }

    /// Store the plan and move on to implementation.
    pub fn record_plan(&mut self, plan: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Plan)?;
        if plan.trim().is_empty() {
            return Err(TransitionError::Invalid("plan text is empty".into()));
        }
        self.plan = Some(plan.trim().to_string());
        self.advance_stage(now)?;
        Ok(())
    }

    /// Record a verify run. The stage passes iff every blocking gate passed.
    pub fn record_verification(
        &mut self,
        gates: Vec<GateResult>,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, TransitionError> {
        self.ensure_stage(Stage::Verify)?;
        let passed = gates.iter().filter(|g| g.blocking).all(|g| g.passed);
        let note = gates
            .is_empty()
            .then(|| "no gates configured, nothing was checked".to_string());
        self.history.push(StageResult {
            stage: Stage::Verify,
            passed,
            at: now,
            gates,
            note,
        });

        if passed {
            self.set_stage_status(Stage::Verify, StageStatus::Passed);
            let fix_status = if self.fix_attempts == 0 {
                StageStatus::Skipped
            } else {
                StageStatus::Passed
            };
            self.set_stage_status(Stage::Fix, fix_status);
            self.enter(Stage::Review, now);
            return Ok(VerifyOutcome::Passed);
        }

        self.set_stage_status(Stage::Verify, StageStatus::Failed);
        if self.fix_attempts >= self.max_fix_attempts {
            self.status = PipelineStatus::Failed;
            self.active = false;
            self.last_activity_at = Some(now);
            warn!(attempts = self.fix_attempts, "pipeline fix attempts exhausted");
            return Ok(VerifyOutcome::Exhausted);
        }
        self.fix_attempts += 1;
        self.enter(Stage::Fix, now);
        Ok(VerifyOutcome::Fixing {
            attempt: self.fix_attempts,
        })
    }

    /// Finishing a fix always returns to verify.
    pub fn complete_fix(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_stage(Stage::Fix)?;
        self.history.push(StageResult {
            stage: Stage::Fix,
            passed: true,
            at: now,
            gates: Vec::new(),
            note: Some(format!("fix attempt {}", self.fix_attempts)),
        });
        self.enter(Stage::Verify, now);
        Ok(())
    }

    pub fn abort(&mut self, now: DateTime<Utc>) {
        if self.status == PipelineStatus::Running {
            self.status = PipelineStatus::Aborted;
        }
        self.active = false;
        self.last_activity_at = Some(now);
    }

    /// Gates from the most recent verify run.
    pub fn last_verification(&self) -> Option<&StageResult> {
        self.history.iter().rev().find(|r| r.stage == Stage::Verify)
    }
}

/// Run every gate in order, even after a blocking failure.
pub fn run_gates(
    gates: &[GateConfig],
    runner: &dyn CommandRunner,
    cwd: &Path,
    timeout: Duration,
) -> Vec<GateResult> {
    gates
        .iter()
        .map(|gate| {
            let _span = tracing::info_span!("gate", label = %gate.label).entered();
            let output = runner.run(&gate.command, cwd, timeout);
            let mut excerpt = tail(&output.combined(), EXCERPT_CHARS);
            if output.timed_out {
                excerpt = format!("timed out after {}s\n{excerpt}", timeout.as_secs())
                    .trim_end()
                    .to_string();
            }
            if !output.exit_ok {
                warn!(label = %gate.label, blocking = gate.blocking, "gate failed");
            }
            GateResult {
                label: gate.label.clone(),
                command: gate.command.clone(),
                blocking: gate.blocking,
                passed: output.exit_ok,
                timed_out: output.timed_out,
                excerpt,
            }
        })
        .collect()
}

/// Last `max` characters of `text`; failures usually print their cause at the end.
fn tail(text: &str, max: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max).collect();
    format!("…{tail}")
}

/// Where and how verification gates run.
pub struct GateRun<'a> {
    pub gates: &'a [GateConfig],
    pub runner: &'a dyn CommandRunner,
    pub cwd: &'a Path,
    pub timeout: Duration,
}

/// Run the gates and record the result on the persisted pipeline.
pub fn verify(
    store: &dyn StateStore,
    run: &GateRun<'_>,
    now: DateTime<Utc>,
) -> anyhow::Result<Result<VerifyOutcome, TransitionError>> {
    let current: PipelineState = load_document(store)?;
    if let Err(e) = current.ensure_stage(Stage::Verify) {
        return Ok(Err(e));
    }
    let results = run_gates(run.gates, run.runner, run.cwd, run.timeout);
    transition(store, now, |p: &mut PipelineState| {
        p.record_verification(results.clone(), now)
    })
}

/// One Stop event: finished work moves to verification, verification runs,
/// and review finishing completes the pipeline.
pub fn on_stop(
    store: &dyn StateStore,
    run: &GateRun<'_>,
    now: DateTime<Utc>,
) -> anyhow::Result<Result<ControlSignal, TransitionError>> {
    let current: PipelineState = load_document(store)?;
    if !current.active {
        return Ok(Ok(ControlSignal::AllowStop(None)));
    }

    match current.current_stage {
        Stage::Plan => return Ok(render_context(&current).map(ControlSignal::Continue)),
        Stage::Implement => {
            if let Err(e) = transition(store, now, |p: &mut PipelineState| {
                p.ensure_stage(Stage::Implement)?;
                p.advance_stage(now)
            })? {
                return Ok(Err(e));
            }
        }
        Stage::Fix => {
            if let Err(e) = transition(store, now, |p: &mut PipelineState| p.complete_fix(now))? {
                return Ok(Err(e));
            }
        }
        Stage::Verify => {}
        Stage::Review => {
            return Ok(transition(store, now, |p: &mut PipelineState| {
                p.ensure_stage(Stage::Review)?;
                p.advance_stage(now)?;
                Ok(ControlSignal::AllowStop(Some(format!(
                    "pipeline complete: {}",
                    p.goal
                ))))
            })?);
        }
        Stage::Done => return Ok(Ok(ControlSignal::AllowStop(None))),
    }

    let outcome = match verify(store, run, now)? {
        Ok(outcome) => outcome,
        Err(e) => return Ok(Err(e)),
    };
    let after: PipelineState = load_document(store)?;
    Ok(match outcome {
        VerifyOutcome::Passed | VerifyOutcome::Fixing { .. } => {
            render_context(&after).map(ControlSignal::Continue)
        }
        VerifyOutcome::Exhausted => Ok(ControlSignal::Abort(format!(
            "pipeline failed: verification still failing after {} fix attempts",
            after.fix_attempts
        ))),
    })
}

#[derive(Serialize)]
struct PipelineContext<'a> {
    goal: &'a str,
    stage: &'static str,
    plan: Option<&'a str>,
    fix_attempts: u32,
    max_fix_attempts: u32,
    failed_gates: Vec<&'a GateResult>,
    note: Option<&'a str>,
}

impl ModeDocument for PipelineState {
    const MODE: Mode = Mode::Pipeline;
    const KEY: &'static str = keys::PIPELINE;

    fn is_active(&self) -> bool {
        self.active
    }

    fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    fn outcome(&self) -> ModeOutcome {
        match self.status {
            PipelineStatus::Completed => ModeOutcome::Success,
            PipelineStatus::Failed => ModeOutcome::Failed,
            PipelineStatus::Aborted | PipelineStatus::Running => ModeOutcome::Aborted,
        }
    }

    fn halt(&mut self, _outcome: ModeOutcome, now: DateTime<Utc>) {
        self.abort(now);
    }

    fn status_line(&self) -> String {
        let mut line = format!(
            "pipeline: {} stage, {}",
            self.current_stage.as_str(),
            self.status.as_str()
        );
        if self.fix_attempts > 0 {
            let _ = write!(
                line,
                " (fix attempt {}/{})",
                self.fix_attempts, self.max_fix_attempts
            );
        }
        line
    }

    fn status_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Pipeline");
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Goal:** {}", self.goal);
        let _ = writeln!(out, "- **Status:** {}", self.status.as_str());
        let _ = writeln!(out, "- **Stage:** {}", self.current_stage.as_str());
        let _ = writeln!(
            out,
            "- **Fix attempts:** {} of {}",
            self.fix_attempts, self.max_fix_attempts
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "## Stages");
        let _ = writeln!(out);
        for info in &self.stages {
            let marker = match info.status {
                StageStatus::Passed => "x",
                StageStatus::InProgress => ">",
                StageStatus::Failed => "!",
                StageStatus::Skipped => "-",
                StageStatus::Pending => " ",
            };
            let _ = writeln!(out, "- [{marker}] {}", info.stage.as_str());
        }
        if !self.history.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## History");
            let _ = writeln!(out);
            for result in &self.history {
                let verdict = if result.passed { "passed" } else { "failed" };
                let _ = write!(
                    out,
                    "- {} {} {verdict}",
                    result.at.format("%H:%M:%S"),
                    result.stage.as_str()
                );
                if let Some(note) = &result.note {
                    let _ = write!(out, " ({note})");
                }
                let _ = writeln!(out);
                for gate in &result.gates {
                    let g = if gate.passed { "pass" } else { "FAIL" };
                    let kind = if gate.blocking { "" } else { ", non-blocking" };
                    let _ = writeln!(out, "  - {}: {g}{kind}", gate.label);
                }
            }
        }
        out
    }

    fn context_block(&self) -> anyhow::Result<String> {
        let last = self.last_verification();
        let failed_gates = match (self.current_stage, last) {
            (Stage::Fix, Some(result)) => result.gates.iter().filter(|g| !g.passed).collect(),
            _ => Vec::new(),
        };
        template::render(
            ContextTemplate::Pipeline,
            &PipelineContext {
                goal: &self.goal,
                stage: self.current_stage.as_str(),
                plan: self.plan.as_deref(),
                fix_attempts: self.fix_attempts,
                max_fix_attempts: self.max_fix_attempts,
                failed_gates,
                note: last.and_then(|r| r.note.as_deref()),
            },
        )
    }
}
