//! Bounded-concurrency task pool.
//!
//! The pool only accounts for slots; whoever claims a task runs it elsewhere
//! and reports back with complete or fail.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ControlSignal, Mode, ModeDocument, ModeOutcome, render_context};
use crate::error::TransitionError;
use crate::state::keys;
use crate::template::{self, ContextTemplate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwarmTaskStatus {
    #[default]
    Pending,
    Assigned,
    Done,
    Failed,
}

impl SwarmTaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SwarmTaskStatus::Pending => "pending",
            SwarmTaskStatus::Assigned => "assigned",
            SwarmTaskStatus::Done => "done",
            SwarmTaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmTask {
    pub id: String,
    pub description: String,
    pub status: SwarmTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tasks: Vec<SwarmTask>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

fn default_concurrency() -> u32 {
    3
}

impl Default for SwarmState {
    fn default() -> Self {
        Self {
            active: false,
            tasks: Vec::new(),
            concurrency: default_concurrency(),
            cancelled: false,
            started_at: None,
            last_activity_at: None,
        }
    }
}

impl SwarmState {
    /// Task ids are `swarm-1`, `swarm-2`, … in the given order.
    pub fn new(descriptions: &[String], concurrency: u32, now: DateTime<Utc>) -> Self {
        let tasks = descriptions
            .iter()
            .enumerate()
            .map(|(i, d)| SwarmTask {
                id: format!("swarm-{}", i + 1),
                description: d.clone(),
                status: SwarmTaskStatus::Pending,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
            })
            .collect();
        Self {
            active: true,
            tasks,
            concurrency: concurrency.max(1),
            cancelled: false,
            started_at: Some(now),
            last_activity_at: Some(now),
        }
    }

    fn ensure_active(&self) -> Result<(), TransitionError> {
        if self.active {
            Ok(())
        } else {
            Err(TransitionError::NotActive { mode: "swarm" })
        }
    }

    pub fn count(&self, status: SwarmTaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    fn free_slots(&self) -> usize {
        let concurrency = usize::try_from(self.concurrency).unwrap_or(usize::MAX);
        concurrency.saturating_sub(self.count(SwarmTaskStatus::Assigned))
    }

    /// Pending tasks that fit in the free slots, in original order.
    pub fn get_assignable_tasks(&self) -> Vec<&SwarmTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == SwarmTaskStatus::Pending)
            .take(self.free_slots())
            .collect()
    }

    /// Claim a pending task. Returns `false` (and changes nothing) when the
    /// task is not pending.
    pub fn assign_task(&mut self, id: &str, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        self.ensure_active()?;
        let task = self.find_mut(id)?;
        if task.status != SwarmTaskStatus::Pending {
            return Ok(false);
        }
        task.status = SwarmTaskStatus::Assigned;
        task.started_at = Some(now);
        self.last_activity_at = Some(now);
        info!(task = id, "swarm task assigned");
        Ok(true)
    }

    /// Assign every currently assignable task. Returns their ids.
    pub fn fill_slots(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, TransitionError> {
        self.ensure_active()?;
        let ids: Vec<String> = self
            .get_assignable_tasks()
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            self.assign_task(id, now)?;
        }
        Ok(ids)
    }

    pub fn complete_task(
        &mut self,
        id: &str,
        result: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.finish_task(id, SwarmTaskStatus::Done, result, now)
    }

    pub fn fail_task(&mut self, id: &str, error: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish_task(id, SwarmTaskStatus::Failed, Some(error), now)
    }

    fn finish_task(
        &mut self,
        id: &str,
        status: SwarmTaskStatus,
        payload: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.ensure_active()?;
        let task = self.find_mut(id)?;
        if task.status != SwarmTaskStatus::Assigned {
            return Err(TransitionError::WrongStatus {
                kind: "swarm task",
                id: id.to_string(),
                status: task.status.as_str().to_string(),
                expected: "assigned",
            });
        }
        task.status = status;
        task.completed_at = Some(now);
        match status {
            SwarmTaskStatus::Failed => task.error = payload.map(str::to_string),
            _ => task.result = payload.map(str::to_string),
        }
        self.last_activity_at = Some(now);
        info!(task = id, status = status.as_str(), "swarm task finished");
        Ok(())
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut SwarmTask, TransitionError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TransitionError::UnknownId {
                kind: "swarm task",
                id: id.to_string(),
            })
    }

    pub fn is_swarm_complete(&self) -> bool {
        !self
            .tasks
            .iter()
            .any(|t| matches!(t.status, SwarmTaskStatus::Pending | SwarmTaskStatus::Assigned))
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.cancelled = true;
        self.active = false;
        self.last_activity_at = Some(now);
    }

    /// One Stop event: a finished pool ends, otherwise free slots are filled
    /// and the agent keeps going.
    pub fn on_stop(&mut self, now: DateTime<Utc>) -> Result<ControlSignal, TransitionError> {
        self.ensure_active()?;
        if self.is_swarm_complete() {
            self.active = false;
            self.last_activity_at = Some(now);
            return Ok(ControlSignal::AllowStop(Some(format!(
                "swarm complete: {} done, {} failed",
                self.count(SwarmTaskStatus::Done),
                self.count(SwarmTaskStatus::Failed)
            ))));
        }
        self.fill_slots(now)?;
        Ok(ControlSignal::Continue(render_context(self)?))
    }
}

#[derive(Serialize)]
struct SwarmContext<'a> {
    assigned: Vec<&'a SwarmTask>,
    pending: usize,
    done: usize,
    failed: usize,
    total: usize,
    concurrency: u32,
}

impl ModeDocument for SwarmState {
    const MODE: Mode = Mode::Swarm;
    const KEY: &'static str = keys::SWARM;

    fn is_active(&self) -> bool {
        self.active
    }

    fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    fn outcome(&self) -> ModeOutcome {
        if self.cancelled {
            ModeOutcome::Cancelled
        } else if self.count(SwarmTaskStatus::Done) == 0 && self.count(SwarmTaskStatus::Failed) > 0 {
            ModeOutcome::Failed
        } else {
            ModeOutcome::Success
        }
    }

    fn halt(&mut self, _outcome: ModeOutcome, now: DateTime<Utc>) {
        self.cancel(now);
    }

    fn status_line(&self) -> String {
        format!(
            "swarm: {} done, {} failed, {} running, {} pending (concurrency {})",
            self.count(SwarmTaskStatus::Done),
            self.count(SwarmTaskStatus::Failed),
            self.count(SwarmTaskStatus::Assigned),
            self.count(SwarmTaskStatus::Pending),
            self.concurrency
        )
    }

    fn status_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Swarm");
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Active:** {}", self.active);
        let _ = writeln!(out, "- **Concurrency:** {}", self.concurrency);
        let _ = writeln!(out);
        let _ = writeln!(out, "## Tasks");
        let _ = writeln!(out);
        for task in &self.tasks {
            let _ = write!(out, "- `{}` **{}** {}", task.id, task.status.as_str(), task.description);
            if let Some(err) = &task.error {
                let _ = write!(out, " (error: {})", super::excerpt(err, 80));
            } else if let Some(result) = &task.result {
                let _ = write!(out, " (result: {})", super::excerpt(result, 80));
            }
            let _ = writeln!(out);
        }
        out
    }

    fn context_block(&self) -> anyhow::Result<String> {
        template::render(
            ContextTemplate::Swarm,
            &SwarmContext {
                assigned: self
                    .tasks
                    .iter()
                    .filter(|t| t.status == SwarmTaskStatus::Assigned)
                    .collect(),
                pending: self.count(SwarmTaskStatus::Pending),
                done: self.count(SwarmTaskStatus::Done),
                failed: self.count(SwarmTaskStatus::Failed),
                total: self.tasks.len(),
                concurrency: self.concurrency,
            },
        )
    }
}
