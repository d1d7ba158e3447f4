//! Bounded retry loop for a single task.
//!
//! Every Stop event is one iteration. The guidance handed back to the agent
//! shifts as iterations pile up, and a long failure streak overrides the
//! iteration count entirely.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ControlSignal, Mode, ModeDocument, ModeOutcome};
use crate::error::TransitionError;
use crate::state::keys;
use crate::template::{self, ContextTemplate};

pub const MAX_APPROACHES: usize = 10;
pub const ESCALATION_FAILURES: u32 = 5;
const ESCALATION_APPROACHES_SHOWN: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RalphStatus {
    #[default]
    Running,
    Success,
    Failed,
    Aborted,
}

impl RalphStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RalphStatus::Running => "running",
            RalphStatus::Success => "success",
            RalphStatus::Failed => "failed",
            RalphStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphState {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub max_iterations: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    #[serde(default)]
    pub approaches: Vec<String>,
    #[serde(default)]
    pub status: RalphStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Guidance band, chosen by failure streak first and iteration second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyTier {
    Straightforward,
    Reassess,
    LateralThinking,
    MinimumViable,
    Escalation,
}

impl StrategyTier {
    pub fn label(self) -> &'static str {
        match self {
            StrategyTier::Straightforward => "straightforward",
            StrategyTier::Reassess => "reassess",
            StrategyTier::LateralThinking => "lateral thinking",
            StrategyTier::MinimumViable => "minimum viable",
            StrategyTier::Escalation => "ESCALATION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Strategy {
    pub tier: StrategyTier,
    pub guidance: String,
}

impl RalphState {
    pub fn new(task: &str, max_iterations: u32, now: DateTime<Utc>) -> Self {
        Self {
            active: true,
            task: task.to_string(),
            iteration: 0,
            max_iterations,
            consecutive_failures: 0,
            last_failure_reason: None,
            approaches: Vec::new(),
            status: RalphStatus::Running,
            started_at: Some(now),
            last_activity_at: Some(now),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RalphStatus::Running
    }

    fn ensure_running(&self) -> Result<(), TransitionError> {
        if !self.active && self.status == RalphStatus::Running {
            return Err(TransitionError::NotActive { mode: "ralph" });
        }
        if self.is_terminal() {
            return Err(TransitionError::Terminal {
                mode: "ralph",
                status: self.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    pub fn advance_iteration(&mut self, now: DateTime<Utc>) -> Result<u32, TransitionError> {
        self.ensure_running()?;
        self.iteration += 1;
        self.last_activity_at = Some(now);
        Ok(self.iteration)
    }

    pub fn record_failure(&mut self, reason: &str, now: DateTime<Utc>) -> Result<u32, TransitionError> {
        self.ensure_running()?;
        self.consecutive_failures += 1;
        self.last_failure_reason = Some(reason.to_string());
        self.last_activity_at = Some(now);
        if self.consecutive_failures >= ESCALATION_FAILURES {
            warn!(failures = self.consecutive_failures, "ralph failure streak, escalating");
        }
        Ok(self.consecutive_failures)
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.consecutive_failures = 0;
        self.status = RalphStatus::Success;
        self.active = false;
        self.last_activity_at = Some(now);
        info!(iteration = self.iteration, "ralph loop succeeded");
        Ok(())
    }

    /// Keep only the most recent [`MAX_APPROACHES`].
    pub fn record_approach(&mut self, text: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.ensure_running()?;
        self.approaches.push(text.to_string());
        if self.approaches.len() > MAX_APPROACHES {
            let excess = self.approaches.len() - MAX_APPROACHES;
            self.approaches.drain(..excess);
        }
        self.last_activity_at = Some(now);
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Turn an exhausted running loop into `failed`. Returns whether it did.
    pub fn check_exhaustion(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != RalphStatus::Running || !self.is_exhausted() {
            return false;
        }
        self.status = RalphStatus::Failed;
        self.active = false;
        self.last_activity_at = Some(now);
        warn!(iteration = self.iteration, max = self.max_iterations, "ralph loop exhausted");
        true
    }

    pub fn abort(&mut self, now: DateTime<Utc>) {
        if self.status == RalphStatus::Running {
            self.status = RalphStatus::Aborted;
        }
        self.active = false;
        self.last_activity_at = Some(now);
    }

    pub fn strategy(&self) -> Strategy {
        let tier = if self.consecutive_failures >= ESCALATION_FAILURES {
            StrategyTier::Escalation
        } else {
            match self.iteration {
                0..=3 => StrategyTier::Straightforward,
                4..=7 => StrategyTier::Reassess,
                8..=12 => StrategyTier::LateralThinking,
                _ => StrategyTier::MinimumViable,
            }
        };

        let mut guidance = match tier {
            StrategyTier::Straightforward => "Try the most direct fix for the task.".to_string(),
            StrategyTier::Reassess => "Re-read the files involved and challenge the assumptions \
                behind earlier attempts before changing more code."
                .to_string(),
            StrategyTier::LateralThinking => "Look elsewhere. The cause may live in other parts \
                of the codebase or in recent git history."
                .to_string(),
            StrategyTier::MinimumViable => {
                "Find the smallest correct change that satisfies the task and stop there.".to_string()
            }
            StrategyTier::Escalation => {
                let mut text = format!(
                    "{} consecutive failures. Stop the current approach entirely and choose \
                     something different.",
                    self.consecutive_failures
                );
                let recent: Vec<&str> = self
                    .approaches
                    .iter()
                    .rev()
                    .take(ESCALATION_APPROACHES_SHOWN)
                    .map(String::as_str)
                    .collect();
                if !recent.is_empty() {
                    let _ = write!(text, " Do not repeat: {}.", recent.join("; "));
                }
                text
            }
        };
        if let Some(reason) = &self.last_failure_reason {
            let _ = write!(guidance, " Last failure: {reason}");
        }
        Strategy { tier, guidance }
    }

    /// One Stop event: exhausted loops fail, anything else runs another iteration.
    pub fn on_stop(&mut self, now: DateTime<Utc>) -> Result<ControlSignal, TransitionError> {
        match self.status {
            RalphStatus::Success => {
                return Ok(ControlSignal::AllowStop(Some(format!(
                    "ralph finished after {} iteration(s)",
                    self.iteration
                ))));
            }
            RalphStatus::Failed | RalphStatus::Aborted => {
                return Ok(ControlSignal::AllowStop(None));
            }
            RalphStatus::Running => {}
        }
        if self.check_exhaustion(now) {
            return Ok(ControlSignal::Abort(format!(
                "ralph exhausted {} iterations without success: {}",
                self.max_iterations,
                self.last_failure_reason.as_deref().unwrap_or("no failure recorded")
            )));
        }
        self.advance_iteration(now)?;
        Ok(ControlSignal::Continue(super::render_context(self)?))
    }
}

#[derive(Serialize)]
struct RalphContext<'a> {
    task: &'a str,
    iteration: u32,
    max_iterations: u32,
    tier: &'static str,
    guidance: String,
    approaches: &'a [String],
}

impl ModeDocument for RalphState {
    const MODE: Mode = Mode::Ralph;
    const KEY: &'static str = keys::RALPH;

    fn is_active(&self) -> bool {
        self.active
    }

    fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    fn outcome(&self) -> ModeOutcome {
        match self.status {
            RalphStatus::Success => ModeOutcome::Success,
            RalphStatus::Failed => ModeOutcome::Failed,
            RalphStatus::Aborted | RalphStatus::Running => ModeOutcome::Aborted,
        }
    }

    fn halt(&mut self, _outcome: ModeOutcome, now: DateTime<Utc>) {
        self.abort(now);
    }

    fn status_line(&self) -> String {
        let mut line = format!(
            "ralph: iteration {}/{}, {}",
            self.iteration,
            self.max_iterations,
            self.status.as_str()
        );
        if self.consecutive_failures > 0 {
            let _ = write!(line, " ({} consecutive failures)", self.consecutive_failures);
        }
        line
    }

    fn status_report(&self) -> String {
        let strategy = self.strategy();
        let mut out = String::new();
        let _ = writeln!(out, "# Ralph loop");
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Task:** {}", self.task);
        let _ = writeln!(out, "- **Status:** {}", self.status.as_str());
        let _ = writeln!(out, "- **Iteration:** {} of {}", self.iteration, self.max_iterations);
        let _ = writeln!(out, "- **Consecutive failures:** {}", self.consecutive_failures);
        if let Some(reason) = &self.last_failure_reason {
            let _ = writeln!(out, "- **Last failure:** {reason}");
        }
        let _ = writeln!(out, "- **Strategy:** {}", strategy.tier.label());
        if !self.approaches.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Approaches");
            let _ = writeln!(out);
            for (i, a) in self.approaches.iter().enumerate() {
                let _ = writeln!(out, "{}. {a}", i + 1);
            }
        }
        out
    }

    fn context_block(&self) -> anyhow::Result<String> {
        let strategy = self.strategy();
        template::render(
            ContextTemplate::Ralph,
            &RalphContext {
                task: &self.task,
                iteration: self.iteration,
                max_iterations: self.max_iterations,
                tier: strategy.tier.label(),
                guidance: strategy.guidance,
                approaches: &self.approaches,
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

    #[test]
    fn starts_at_iteration_zero() {
        let r = RalphState::new("fix login", 10, now());
        assert_eq!(r.iteration, 0);
        assert!(r.active);
        assert_eq!(r.status, RalphStatus::Running);
    }

    #[test]
    fn exhaustion_scenario_with_three_iterations() {
        let mut r = RalphState::new("fix login", 3, now());
        for round in 1..=3 {
            r.advance_iteration(now()).unwrap();
            r.record_failure("tests fail", now()).unwrap();
            let exhausted = r.check_exhaustion(now());
            assert_eq!(exhausted, round == 3, "round {round}");
        }
        assert!(r.is_exhausted());
        assert_eq!(r.status, RalphStatus::Failed);
        assert!(!r.active);
        assert!(r.advance_iteration(now()).is_err());
    }

    #[test]
    fn approaches_keep_most_recent_ten() {
        let mut r = RalphState::new("t", 10, now());
        for i in 1..=12 {
            r.record_approach(&i.to_string(), now()).unwrap();
            assert!(r.approaches.len() <= MAX_APPROACHES);
        }
        let expected: Vec<String> = (3..=12).map(|i| i.to_string()).collect();
        assert_eq!(r.approaches, expected);
    }

    #[test]
    fn success_is_terminal() {
        let mut r = RalphState::new("t", 10, now());
        r.record_failure("x", now()).unwrap();
        r.record_success(now()).unwrap();
        assert_eq!(r.consecutive_failures, 0);
        assert_eq!(r.status, RalphStatus::Success);
        assert!(!r.active);
        assert_eq!(
            r.record_failure("y", now()),
            Err(TransitionError::Terminal {
                mode: "ralph",
                status: "success".into()
            })
        );
        assert!(!r.check_exhaustion(now()));
    }

    #[test]
    fn strategy_tiers_by_iteration() {
        let mut r = RalphState::new("t", 20, now());
        let tiers: Vec<StrategyTier> = (1..=14)
            .map(|_| {
                r.advance_iteration(now()).unwrap();
                r.strategy().tier
            })
            .collect();
        assert_eq!(tiers[0], StrategyTier::Straightforward);
        assert_eq!(tiers[2], StrategyTier::Straightforward);
        assert_eq!(tiers[3], StrategyTier::Reassess);
        assert_eq!(tiers[6], StrategyTier::Reassess);
        assert_eq!(tiers[7], StrategyTier::LateralThinking);
        assert_eq!(tiers[11], StrategyTier::LateralThinking);
        assert_eq!(tiers[12], StrategyTier::MinimumViable);
    }

    #[test]
    fn failure_streak_overrides_iteration() {
        let mut r = RalphState::new("t", 20, now());
        r.advance_iteration(now()).unwrap();
        for a in ["a1", "a2", "a3", "a4"] {
            r.record_approach(a, now()).unwrap();
        }
        for _ in 0..5 {
            r.record_failure("linker error", now()).unwrap();
        }
        let s = r.strategy();
        assert_eq!(s.tier, StrategyTier::Escalation);
        assert!(s.guidance.contains("Stop the current approach entirely"));
        assert!(s.guidance.contains("a4; a3; a2"));
        assert!(!s.guidance.contains("a1"));
        assert!(s.guidance.contains("Last failure: linker error"));
    }

    #[test]
    fn every_tier_mentions_last_failure() {
        let mut r = RalphState::new("t", 20, now());
        r.record_failure("boom", now()).unwrap();
        for _ in 0..13 {
            r.advance_iteration(now()).unwrap();
            assert!(r.strategy().guidance.contains("boom"));
        }
    }

    #[test]
    fn stop_advances_then_aborts_when_exhausted() {
        let mut r = RalphState::new("fix it", 2, now());
        r.advance_iteration(now()).unwrap();

        let signal = r.on_stop(now()).unwrap();
        let ControlSignal::Continue(ctx) = signal else {
            panic!("expected continue, got {signal:?}");
        };
        assert!(ctx.contains("iteration 2 of 2"));
        assert!(ctx.contains("fix it"));

        assert!(matches!(r.on_stop(now()).unwrap(), ControlSignal::Abort(_)));
        assert_eq!(r.status, RalphStatus::Failed);
        assert_eq!(r.outcome(), ModeOutcome::Failed);
    }

    #[test]
    fn abort_marks_running_loop() {
        let mut r = RalphState::new("t", 5, now());
        r.abort(now());
        assert_eq!(r.status, RalphStatus::Aborted);
        assert!(!r.active);
    }

    #[test]
    fn report_lists_approaches() {
        let mut r = RalphState::new("t", 5, now());
        r.record_approach("bisect", now()).unwrap();
        let report = r.status_report();
        assert!(report.contains("# Ralph loop"));
        assert!(report.contains("1. bisect"));
        assert_eq!(r.status_line(), "ralph: iteration 0/5, running");
    }
}
