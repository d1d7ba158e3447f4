//! Sequential task runner with review checkpoints.
//!
//! Tasks run one at a time in queue order. After a run of completed tasks the
//! runner pauses for review until someone resumes it, and a streak of failed
//! tasks aborts the whole run.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ControlSignal, Mode, ModeDocument, ModeOutcome, render_context};
use crate::error::TransitionError;
use crate::state::keys;
use crate::template::{self, ContextTemplate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed | TaskStatus::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotTask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tasks: Vec<AutopilotTask>,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub tasks_completed_since_review: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_tasks_before_review")]
    pub max_tasks_before_review: u32,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_tasks_before_review() -> u32 {
    5
}

impl Default for AutopilotState {
    fn default() -> Self {
        Self {
            active: false,
            tasks: Vec::new(),
            current_task_id: None,
            tasks_completed_since_review: 0,
            consecutive_failures: 0,
            max_consecutive_failures: default_max_consecutive_failures(),
            max_tasks_before_review: default_max_tasks_before_review(),
            aborted: false,
            started_at: None,
            last_activity_at: None,
        }
    }
}

impl AutopilotState {
    /// Build a queue with ids `task-1`, `task-2`, … in the given order.
    pub fn new(
        descriptions: &[String],
        max_consecutive_failures: u32,
        max_tasks_before_review: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let tasks = descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| AutopilotTask {
                id: format!("task-{}", i + 1),
                description: d.clone(),
                status: TaskStatus::Pending,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();
        Self {
            active: true,
            tasks,
            max_consecutive_failures,
            max_tasks_before_review,
            started_at: Some(now),
            last_activity_at: Some(now),
            ..Self::default()
        }
    }

    fn ensure_active(&self) -> Result<(), TransitionError> {
        if self.active {
            Ok(())
        } else {
            Err(TransitionError::NotActive { mode: "autopilot" })
        }
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut AutopilotTask, TransitionError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TransitionError::UnknownId {
                kind: "task",
                id: id.to_string(),
            })
    }

    pub fn current_task(&self) -> Option<&AutopilotTask> {
        let id = self.current_task_id.as_deref()?;
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Promote the first pending task. `Ok(None)` when nothing is pending.
    pub fn start_next_task(&mut self, now: DateTime<Utc>) -> Result<Option<String>, TransitionError> {
        self.ensure_active()?;
        if let Some(current) = &self.current_task_id {
            return Err(TransitionError::Invalid(format!(
                "task '{current}' is still in progress"
            )));
        }
        let Some(task) = self.tasks.iter_mut().find(|t| t.status == TaskStatus::Pending) else {
            return Ok(None);
        };
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        let id = task.id.clone();
        self.current_task_id = Some(id.clone());
        self.last_activity_at = Some(now);
        info!(task = %id, "autopilot task started");
        Ok(Some(id))
    }

    pub fn complete_current_task(&mut self, now: DateTime<Utc>) -> Result<String, TransitionError> {
        self.ensure_active()?;
        let id = self.current_task_id.clone().ok_or(TransitionError::NoCurrentTask)?;
        let task = self.task_mut(&id)?;
        task.status = TaskStatus::Done;
        task.completed_at = Some(now);
        self.tasks_completed_since_review += 1;
        self.consecutive_failures = 0;
        self.current_task_id = None;
        self.last_activity_at = Some(now);
        info!(task = %id, "autopilot task done");
        Ok(id)
    }

    pub fn fail_current_task(&mut self, error: &str, now: DateTime<Utc>) -> Result<String, TransitionError> {
        self.ensure_active()?;
        let id = self.current_task_id.clone().ok_or(TransitionError::NoCurrentTask)?;
        let task = self.task_mut(&id)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.completed_at = Some(now);
        self.consecutive_failures += 1;
        self.current_task_id = None;
        self.last_activity_at = Some(now);
        warn!(task = %id, failures = self.consecutive_failures, "autopilot task failed");
        Ok(id)
    }

    /// Skip the named pending task, or the current one when no id is given.
    pub fn skip_task(&mut self, id: Option<&str>, now: DateTime<Utc>) -> Result<String, TransitionError> {
        self.ensure_active()?;
        let id = match id {
            Some(id) => id.to_string(),
            None => self.current_task_id.clone().ok_or(TransitionError::NoCurrentTask)?,
        };
        let is_current = self.current_task_id.as_deref() == Some(id.as_str());
        let task = self.task_mut(&id)?;
        if !(task.status == TaskStatus::Pending || is_current) {
            return Err(TransitionError::WrongStatus {
                kind: "task",
                id,
                status: task.status.as_str().to_string(),
                expected: "pending or in progress",
            });
        }
        task.status = TaskStatus::Skipped;
        task.completed_at = Some(now);
        if is_current {
            self.current_task_id = None;
        }
        self.last_activity_at = Some(now);
        Ok(id)
    }

    pub fn should_abort(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }

    pub fn should_pause_for_review(&self) -> bool {
        self.tasks_completed_since_review >= self.max_tasks_before_review
    }

    pub fn reset_review_counter(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_active()?;
        self.tasks_completed_since_review = 0;
        self.last_activity_at = Some(now);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_finished())
    }

    pub fn abort(&mut self, now: DateTime<Utc>) {
        self.aborted = true;
        self.active = false;
        self.current_task_id = None;
        self.last_activity_at = Some(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.last_activity_at = Some(now);
        info!("autopilot finished all tasks");
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// One Stop event. Abort and completion end the run; a review checkpoint
    /// lets the agent stop; otherwise the agent keeps working on the current
    /// or next task.
    pub fn on_stop(&mut self, now: DateTime<Utc>) -> Result<ControlSignal, TransitionError> {
        self.ensure_active()?;
        if self.should_abort() {
            self.abort(now);
            return Ok(ControlSignal::Abort(format!(
                "autopilot aborted after {} consecutive task failures",
                self.consecutive_failures
            )));
        }
        if self.current_task_id.is_none() && self.is_complete() {
            self.finish(now);
            return Ok(ControlSignal::AllowStop(Some(format!(
                "autopilot complete: {} done, {} failed, {} skipped",
                self.count(TaskStatus::Done),
                self.count(TaskStatus::Failed),
                self.count(TaskStatus::Skipped)
            ))));
        }
        if self.current_task_id.is_none() && self.should_pause_for_review() {
            return Ok(ControlSignal::AllowStop(Some(format!(
                "autopilot paused for review after {} tasks; run `modegate autopilot resume` to continue",
                self.tasks_completed_since_review
            ))));
        }
        if self.current_task_id.is_none() {
            self.start_next_task(now)?;
        }
        self.last_activity_at = Some(now);
        Ok(ControlSignal::Continue(render_context(self)?))
    }
}

#[derive(Serialize)]
struct AutopilotContext<'a> {
    current: Option<&'a AutopilotTask>,
    done: usize,
    total: usize,
    remaining: Vec<&'a AutopilotTask>,
    paused: bool,
    completed_since_review: u32,
}

impl ModeDocument for AutopilotState {
    const MODE: Mode = Mode::Autopilot;
    const KEY: &'static str = keys::AUTOPILOT;

    fn is_active(&self) -> bool {
        self.active
    }

    fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    fn outcome(&self) -> ModeOutcome {
        if self.aborted {
            ModeOutcome::Aborted
        } else if self.count(TaskStatus::Failed) > 0 && self.count(TaskStatus::Done) == 0 {
            ModeOutcome::Failed
        } else {
            ModeOutcome::Success
        }
    }

    fn halt(&mut self, _outcome: ModeOutcome, now: DateTime<Utc>) {
        self.abort(now);
    }

    fn status_line(&self) -> String {
        let mut line = format!(
            "autopilot: {}/{} tasks done",
            self.count(TaskStatus::Done),
            self.tasks.len()
        );
        if let Some(task) = self.current_task() {
            let _ = write!(line, ", working on {} ({})", task.id, super::excerpt(&task.description, 40));
        } else if self.active && self.should_pause_for_review() {
            line.push_str(", paused for review");
        }
        if self.aborted {
            line.push_str(", aborted");
        }
        line
    }

    fn status_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Autopilot");
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Active:** {}", self.active);
        let _ = writeln!(
            out,
            "- **Completed since review:** {} of {}",
            self.tasks_completed_since_review, self.max_tasks_before_review
        );
        let _ = writeln!(
            out,
            "- **Consecutive failures:** {} of {}",
            self.consecutive_failures, self.max_consecutive_failures
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "## Tasks");
        let _ = writeln!(out);
        for task in &self.tasks {
            let _ = write!(out, "- `{}` **{}** {}", task.id, task.status.as_str(), task.description);
            if let Some(err) = &task.error {
                let _ = write!(out, " (error: {})", super::excerpt(err, 80));
            }
            let _ = writeln!(out);
        }
        out
    }

    fn context_block(&self) -> anyhow::Result<String> {
        template::render(
            ContextTemplate::Autopilot,
            &AutopilotContext {
                current: self.current_task(),
                done: self.count(TaskStatus::Done),
                total: self.tasks.len(),
                remaining: self
                    .tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .collect(),
                paused: self.current_task_id.is_none() && self.should_pause_for_review(),
                completed_since_review: self.tasks_completed_since_review,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2025-03-01T12:00:00Z".parse().unwrap()
    }

    fn state(n: usize) -> AutopilotState {
        let tasks: Vec<String> = (1..=n).map(|i| format!("step {i}")).collect();
        AutopilotState::new(&tasks, 3, 5, now())
    }

    #[test]
    fn tasks_run_in_queue_order() {
        let mut a = state(3);
        assert_eq!(a.start_next_task(now()).unwrap().as_deref(), Some("task-1"));
        assert!(a.start_next_task(now()).is_err());
        a.complete_current_task(now()).unwrap();
        assert_eq!(a.start_next_task(now()).unwrap().as_deref(), Some("task-2"));
        assert_eq!(a.tasks[1].status, TaskStatus::InProgress);
        assert_eq!(a.tasks_completed_since_review, 1);
    }

    #[test]
    fn complete_without_current_task_is_rejected() {
        let mut a = state(1);
        assert_eq!(
            a.complete_current_task(now()),
            Err(TransitionError::NoCurrentTask)
        );
        assert_eq!(
            a.fail_current_task("x", now()),
            Err(TransitionError::NoCurrentTask)
        );
    }

    #[test]
    fn abort_after_three_consecutive_failures_until_success() {
        let mut a = state(6);
        for i in 0..3 {
            assert!(!a.should_abort(), "before failure {i}");
            a.start_next_task(now()).unwrap();
            a.fail_current_task("boom", now()).unwrap();
        }
        assert!(a.should_abort());
        a.start_next_task(now()).unwrap();
        assert!(a.should_abort());
        a.complete_current_task(now()).unwrap();
        assert!(!a.should_abort());
        assert_eq!(a.tasks[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn review_pause_needs_explicit_reset() {
        let mut a = state(7);
        for _ in 0..5 {
            a.start_next_task(now()).unwrap();
            a.complete_current_task(now()).unwrap();
        }
        assert!(a.should_pause_for_review());
        a.start_next_task(now()).unwrap();
        a.complete_current_task(now()).unwrap();
        assert!(a.should_pause_for_review());
        a.reset_review_counter(now()).unwrap();
        assert!(!a.should_pause_for_review());
    }

    #[test]
    fn is_complete_counts_done_failed_and_skipped() {
        let mut a = state(3);
        assert!(!a.is_complete());
        a.start_next_task(now()).unwrap();
        a.complete_current_task(now()).unwrap();
        a.start_next_task(now()).unwrap();
        a.fail_current_task("x", now()).unwrap();
        assert!(!a.is_complete());
        a.skip_task(Some("task-3"), now()).unwrap();
        assert!(a.is_complete());
        assert!(AutopilotState::default().is_complete());
    }

    #[test]
    fn skip_current_or_named_pending() {
        let mut a = state(3);
        a.start_next_task(now()).unwrap();
        assert_eq!(a.skip_task(None, now()).unwrap(), "task-1");
        assert!(a.current_task_id.is_none());
        assert!(matches!(
            a.skip_task(Some("task-1"), now()),
            Err(TransitionError::WrongStatus { .. })
        ));
        assert!(matches!(
            a.skip_task(Some("task-9"), now()),
            Err(TransitionError::UnknownId { .. })
        ));
    }

    #[test]
    fn stop_flow_starts_tasks_pauses_and_finishes() {
        let tasks = vec!["a".to_string(), "b".to_string()];
        let mut a = AutopilotState::new(&tasks, 3, 1, now());

        let ControlSignal::Continue(ctx) = a.on_stop(now()).unwrap() else {
            panic!("expected continue");
        };
        assert!(ctx.contains("task-1"));
        a.complete_current_task(now()).unwrap();

        assert!(matches!(a.on_stop(now()).unwrap(), ControlSignal::AllowStop(Some(_))));
        assert!(a.active);
        a.reset_review_counter(now()).unwrap();

        assert!(matches!(a.on_stop(now()).unwrap(), ControlSignal::Continue(_)));
        a.complete_current_task(now()).unwrap();
        a.reset_review_counter(now()).unwrap();

        let signal = a.on_stop(now()).unwrap();
        assert!(matches!(signal, ControlSignal::AllowStop(Some(ref m)) if m.contains("2 done")));
        assert!(!a.active);
        assert_eq!(a.outcome(), ModeOutcome::Success);
    }

    #[test]
    fn stop_aborts_on_failure_streak() {
        let mut a = state(5);
        for _ in 0..3 {
            a.start_next_task(now()).unwrap();
            a.fail_current_task("boom", now()).unwrap();
        }
        assert!(matches!(a.on_stop(now()).unwrap(), ControlSignal::Abort(_)));
        assert!(!a.active);
        assert_eq!(a.outcome(), ModeOutcome::Aborted);
    }
}
