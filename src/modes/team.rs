//! Multi-worker team coordination.
//!
//! Each worker gets its own branch and worktree. Once every worker has
//! finished, done branches are merged back smallest-first, with files touched
//! by more than one worker called out before merging starts.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ControlSignal, Mode, ModeDocument, ModeOutcome, load_document, transition};
use crate::error::TransitionError;
use crate::shell;
use crate::state::{StateStore, keys};
use crate::template::{self, ContextTemplate};
use crate::vcs::VcsInspector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Pending,
    Working,
    Done,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Working => "working",
            WorkerStatus::Done => "done",
            WorkerStatus::Failed => "failed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, WorkerStatus::Done | WorkerStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: String,
    pub branch: String,
    pub worktree_path: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamStage {
    #[default]
    Working,
    Merging,
    Complete,
}

impl TeamStage {
    pub fn as_str(self) -> &'static str {
        match self {
            TeamStage::Working => "working",
            TeamStage::Merging => "merging",
            TeamStage::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub base_branch: String,
    #[serde(default)]
    pub workers: Vec<WorkerInfo>,
    #[serde(default)]
    pub stage: TeamStage,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Fields a worker update may change. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerUpdate {
    pub status: Option<WorkerStatus>,
    pub modified_files: Option<Vec<String>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeCandidate {
    pub worker: String,
    pub branch: String,
    pub changed_files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOverlap {
    pub path: String,
    pub workers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    pub order: Vec<MergeCandidate>,
    pub overlaps: Vec<FileOverlap>,
    pub steps: Vec<String>,
}

/// Deterministic team layout: `worker-N` on branch `<session>/worker-N` in
/// `.worktrees/<session>-worker-N`, all pending.
pub fn create_team_state(
    session_name: &str,
    base_branch: &str,
    task: &str,
    worker_count: u32,
    now: DateTime<Utc>,
) -> Result<TeamState, TransitionError> {
    shell::validate_session_name(session_name)
        .map_err(|e| TransitionError::Invalid(e.to_string()))?;
    if worker_count == 0 {
        return Err(TransitionError::Invalid("a team needs at least one worker".into()));
    }
    let workers = (1..=worker_count)
        .map(|n| WorkerInfo {
            id: format!("worker-{n}"),
            branch: format!("{session_name}/worker-{n}"),
            worktree_path: format!(".worktrees/{session_name}-worker-{n}"),
            status: WorkerStatus::Pending,
            modified_files: Vec::new(),
            started_at: None,
            completed_at: None,
        })
        .collect();
    Ok(TeamState {
        active: true,
        session_name: session_name.to_string(),
        task: task.to_string(),
        base_branch: base_branch.to_string(),
        workers,
        stage: TeamStage::Working,
        cancelled: false,
        started_at: Some(now),
        last_activity_at: Some(now),
    })
}

impl TeamState {
    /// Merge fields into the matching worker. Unknown ids are a no-op and
    /// return `false`.
    pub fn update_worker(&mut self, id: &str, update: &WorkerUpdate, now: DateTime<Utc>) -> bool {
        let Some(worker) = self.workers.iter_mut().find(|w| w.id == id) else {
            return false;
        };
        if let Some(status) = update.status {
            worker.status = status;
            if status == WorkerStatus::Working && worker.started_at.is_none() {
                worker.started_at = Some(now);
            }
            if status.is_finished() && update.completed_at.is_none() {
                worker.completed_at = Some(now);
            }
        }
        if let Some(files) = &update.modified_files {
            worker.modified_files.clone_from(files);
        }
        if let Some(at) = update.completed_at {
            worker.completed_at = Some(at);
        }
        self.last_activity_at = Some(now);
        info!(worker = id, status = worker.status.as_str(), "team worker updated");
        true
    }

    pub fn all_workers_done(&self) -> bool {
        self.workers.iter().all(|w| w.status.is_finished())
    }

    pub fn count(&self, status: WorkerStatus) -> usize {
        self.workers.iter().filter(|w| w.status == status).count()
    }

    /// Files a done worker changed relative to the base branch. Falls back to
    /// the worker's own report when the VCS cannot answer.
    fn changed_files(&self, worker: &WorkerInfo, vcs: &dyn VcsInspector) -> Vec<String> {
        match vcs.changed_files(&self.base_branch, &worker.branch) {
            Ok(files) => files,
            Err(e) => {
                warn!(worker = %worker.id, error = %e, "falling back to reported modified files");
                worker.modified_files.clone()
            }
        }
    }

    fn done_changes(&self, vcs: &dyn VcsInspector) -> Vec<(&WorkerInfo, Vec<String>)> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Done)
            .map(|w| (w, self.changed_files(w, vcs)))
            .collect()
    }

    /// Done workers, fewest changed files first; ties keep worker order.
    pub fn merge_order(&self, vcs: &dyn VcsInspector) -> Vec<MergeCandidate> {
        order_from(&self.done_changes(vcs))
    }

    /// Files changed by more than one done worker, sorted by path.
    pub fn file_overlaps(&self, vcs: &dyn VcsInspector) -> Vec<FileOverlap> {
        overlaps_from(&self.done_changes(vcs))
    }

    /// Order, overlaps and the merge commands, inspecting each worker once.
    pub fn merge_plan(&self, vcs: &dyn VcsInspector) -> MergePlan {
        let changes = self.done_changes(vcs);
        let order = order_from(&changes);
        let overlaps = overlaps_from(&changes);
        let mut steps = vec![format!("git checkout {}", shell::safe_ident(&self.base_branch))];
        for candidate in &order {
            steps.push(shell::merge_cmd(
                &candidate.branch,
                &format!("merge {} ({})", candidate.worker, self.session_name),
            ));
        }
        for worker in &self.workers {
            steps.push(shell::worktree_remove_cmd(&worker.worktree_path));
        }
        MergePlan {
            order,
            overlaps,
            steps,
        }
    }

    /// Commands that create each pending worker's worktree.
    pub fn setup_steps(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Pending)
            .map(|w| shell::worktree_add_cmd(&w.worktree_path, &w.branch, &self.base_branch))
            .collect()
    }

    fn ensure_active(&self) -> Result<(), TransitionError> {
        if self.active {
            Ok(())
        } else {
            Err(TransitionError::NotActive { mode: "team" })
        }
    }

    /// Move to merging once every worker has finished.
    pub fn begin_merge(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active()?;
        if self.stage != TeamStage::Working {
            return Err(TransitionError::Invalid(format!(
                "team is already {}",
                self.stage.as_str()
            )));
        }
        if !self.all_workers_done() {
            return Err(TransitionError::Invalid(format!(
                "{} worker(s) have not finished",
                self.workers.len() - self.count(WorkerStatus::Done) - self.count(WorkerStatus::Failed)
            )));
        }
        self.stage = TeamStage::Merging;
        self.last_activity_at = Some(now);
        info!(session = %self.session_name, "team merging");
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active()?;
        if self.stage != TeamStage::Merging {
            return Err(TransitionError::Invalid("team is not merging".into()));
        }
        self.stage = TeamStage::Complete;
        self.active = false;
        self.last_activity_at = Some(now);
        info!(session = %self.session_name, "team complete");
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.cancelled = true;
        self.active = false;
        self.last_activity_at = Some(now);
    }
}

fn order_from(changes: &[(&WorkerInfo, Vec<String>)]) -> Vec<MergeCandidate> {
    let mut order: Vec<MergeCandidate> = changes
        .iter()
        .map(|(w, files)| MergeCandidate {
            worker: w.id.clone(),
            branch: w.branch.clone(),
            changed_files: files.len(),
        })
        .collect();
    order.sort_by_key(|c| c.changed_files);
    order
}

fn overlaps_from(changes: &[(&WorkerInfo, Vec<String>)]) -> Vec<FileOverlap> {
    let mut owners: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (worker, files) in changes {
        for file in files {
            let entry = owners.entry(file.as_str()).or_default();
            if !entry.contains(&worker.id) {
                entry.push(worker.id.clone());
            }
        }
    }
    owners
        .into_iter()
        .filter(|(_, workers)| workers.len() > 1)
        .map(|(path, workers)| FileOverlap {
            path: path.to_string(),
            workers,
        })
        .collect()
}

/// One Stop event for the coordinating agent. While workers run the agent
/// may stop; when all have finished it is handed the merge plan; the stop
/// after that completes the team.
pub fn on_stop(
    store: &dyn StateStore,
    vcs: &dyn VcsInspector,
    now: DateTime<Utc>,
) -> anyhow::Result<Result<ControlSignal, TransitionError>> {
    let current: TeamState = load_document(store)?;
    if !current.active {
        return Ok(Ok(ControlSignal::AllowStop(None)));
    }
    match current.stage {
        TeamStage::Working if !current.all_workers_done() => {
            Ok(Ok(ControlSignal::AllowStop(Some(current.status_line()))))
        }
        TeamStage::Working => {
            let plan = current.merge_plan(vcs);
            Ok(transition(store, now, |t: &mut TeamState| {
                t.begin_merge(now)?;
                let ctx = TeamContext::merging(t, &plan);
                template::render(ContextTemplate::Team, &ctx)
                    .map(ControlSignal::Continue)
                    .map_err(|e| TransitionError::Invalid(format!("rendering team context: {e:#}")))
            })?)
        }
        TeamStage::Merging => Ok(transition(store, now, |t: &mut TeamState| {
            t.complete(now)?;
            Ok(ControlSignal::AllowStop(Some(format!(
                "team {} complete: {} worker(s) merged",
                t.session_name,
                t.count(WorkerStatus::Done)
            ))))
        })?),
        TeamStage::Complete => Ok(Ok(ControlSignal::AllowStop(None))),
    }
}

#[derive(Serialize)]
struct TeamContext<'a> {
    session: &'a str,
    task: &'a str,
    base_branch: &'a str,
    stage: &'static str,
    workers: &'a [WorkerInfo],
    setup_steps: Vec<String>,
    plan: Option<&'a MergePlan>,
    update_example: String,
}

impl<'a> TeamContext<'a> {
    fn new(team: &'a TeamState, plan: Option<&'a MergePlan>) -> Self {
        Self {
            session: &team.session_name,
            task: &team.task,
            base_branch: &team.base_branch,
            stage: team.stage.as_str(),
            workers: &team.workers,
            setup_steps: team.setup_steps(),
            plan,
            update_example: shell::team_update_cmd("worker-1", WorkerStatus::Done.as_str()),
        }
    }

    fn merging(team: &'a TeamState, plan: &'a MergePlan) -> Self {
        Self::new(team, Some(plan))
    }
}

impl ModeDocument for TeamState {
    const MODE: Mode = Mode::Team;
    const KEY: &'static str = keys::TEAM;

    fn is_active(&self) -> bool {
        self.active
    }

    fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    fn outcome(&self) -> ModeOutcome {
        if self.cancelled {
            ModeOutcome::Cancelled
        } else if self.stage == TeamStage::Complete {
            ModeOutcome::Success
        } else {
            ModeOutcome::Aborted
        }
    }

    fn halt(&mut self, _outcome: ModeOutcome, now: DateTime<Utc>) {
        self.cancel(now);
    }

    fn status_line(&self) -> String {
        format!(
            "team {}: {}, {}/{} workers done, {} failed",
            self.session_name,
            self.stage.as_str(),
            self.count(WorkerStatus::Done),
            self.workers.len(),
            self.count(WorkerStatus::Failed)
        )
    }

    fn status_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Team {}", self.session_name);
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Task:** {}", self.task);
        let _ = writeln!(out, "- **Base branch:** {}", self.base_branch);
        let _ = writeln!(out, "- **Stage:** {}", self.stage.as_str());
        let _ = writeln!(out);
        let _ = writeln!(out, "| Worker | Status | Branch | Files |");
        let _ = writeln!(out, "|---|---|---|---|");
        for w in &self.workers {
            let _ = writeln!(
                out,
                "| {} | {} | `{}` | {} |",
                w.id,
                w.status.as_str(),
                w.branch,
                w.modified_files.len()
            );
        }
        out
    }

    fn context_block(&self) -> anyhow::Result<String> {
        template::render(ContextTemplate::Team, &TeamContext::new(self, None))
    }
}
