//! Which mode is running, and which may start next.
//!
//! One exclusive mode may be active at a time. Team and swarm ride alongside
//! as companions. Deactivating with a cooldown leaves a sentinel that blocks
//! reactivating the same mode for [`COOLDOWN_TTL_MS`].

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Mode, ModeOutcome};
use crate::state::{StateStore, keys, load_typed, modify_document, update_document};

pub const COOLDOWN_TTL_MS: u64 = 30_000;
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveModeRecord {
    pub name: Mode,
    pub activated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSentinel {
    pub cancelled_mode: Mode,
    pub cancelled_at: DateTime<Utc>,
    pub ttl_ms: u64,
}

impl CancelSentinel {
    /// Milliseconds left before the sentinel expires, `None` once expired.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        let elapsed = (now - self.cancelled_at).num_milliseconds().max(0);
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        self.ttl_ms.checked_sub(elapsed).filter(|ms| *ms > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeHistoryEntry {
    pub mode: Mode,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: DateTime<Utc>,
    pub outcome: ModeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryState {
    #[serde(default)]
    pub active: Option<ActiveModeRecord>,
    #[serde(default)]
    pub companions: Vec<ActiveModeRecord>,
    #[serde(default)]
    pub sentinels: Vec<CancelSentinel>,
    #[serde(default)]
    pub history: Vec<ModeHistoryEntry>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Why an activation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActivationError {
    #[error("mode '{mode}' was recently cancelled, wait {remaining_secs}s before reactivating")]
    Cooldown { mode: Mode, remaining_secs: u64 },

    #[error("mode '{requested}' conflicts with active mode '{active}'")]
    Conflict { requested: Mode, active: Mode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Activated,
    AlreadyActive,
}

/// Structured outcome handed back to callers, `{success, error?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Result<Activation, ActivationError>> for ActivationResult {
    fn from(result: &Result<Activation, ActivationError>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                error: None,
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

impl RegistryState {
    pub fn activate(
        &mut self,
        mode: Mode,
        goal: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Activation, ActivationError> {
        if let Some(remaining) = self.cooldown_remaining_ms(mode, now) {
            return Err(ActivationError::Cooldown {
                mode,
                remaining_secs: remaining.div_ceil(1000),
            });
        }

        if let Some(active) = &self.active
            && active.name.conflicts_with(mode)
        {
            return Err(ActivationError::Conflict {
                requested: mode,
                active: active.name,
            });
        }

        if self.is_active(mode) {
            return Ok(Activation::AlreadyActive);
        }

        let record = ActiveModeRecord {
            name: mode,
            activated_at: now,
            goal: goal.map(str::to_string),
        };
        if mode.is_exclusive() {
            self.active = Some(record);
        } else {
            self.companions.push(record);
        }
        self.last_activity_at = Some(now);
        info!(mode = %mode, "mode activated");
        Ok(Activation::Activated)
    }

    /// No-op unless `mode` is active. Returns the history entry when it was.
    pub fn deactivate(
        &mut self,
        mode: Mode,
        outcome: ModeOutcome,
        set_cooldown: bool,
        now: DateTime<Utc>,
    ) -> Option<ModeHistoryEntry> {
        let record = if mode.is_exclusive() {
            if self.active.as_ref().is_some_and(|a| a.name == mode) {
                self.active.take()
            } else {
                None
            }
        } else {
            self.companions
                .iter()
                .position(|c| c.name == mode)
                .map(|idx| self.companions.remove(idx))
        }?;

        let entry = ModeHistoryEntry {
            mode,
            activated_at: record.activated_at,
            deactivated_at: now,
            outcome,
            goal: record.goal,
        };
        self.history.push(entry.clone());
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }

        if set_cooldown {
            self.sentinels.retain(|s| s.cancelled_mode != mode);
            self.sentinels.push(CancelSentinel {
                cancelled_mode: mode,
                cancelled_at: now,
                ttl_ms: COOLDOWN_TTL_MS,
            });
        }
        self.last_activity_at = Some(now);
        info!(mode = %mode, outcome = %outcome, cooldown = set_cooldown, "mode deactivated");
        Some(entry)
    }

    pub fn is_active(&self, mode: Mode) -> bool {
        self.active.as_ref().is_some_and(|a| a.name == mode)
            || self.companions.iter().any(|c| c.name == mode)
    }

    /// Exclusive record first, then companions in activation order.
    pub fn active_modes(&self) -> Vec<&ActiveModeRecord> {
        self.active.iter().chain(self.companions.iter()).collect()
    }

    pub fn record(&self, mode: Mode) -> Option<&ActiveModeRecord> {
        self.active_modes().into_iter().find(|r| r.name == mode)
    }

    pub fn cooldown_remaining_ms(&self, mode: Mode, now: DateTime<Utc>) -> Option<u64> {
        self.sentinels
            .iter()
            .filter(|s| s.cancelled_mode == mode)
            .find_map(|s| s.remaining_ms(now))
    }

    /// Active modes whose last recorded activity is older than `max_idle`.
    pub fn stale_modes(
        &self,
        max_idle: TimeDelta,
        last_activity: impl Fn(Mode) -> Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Vec<Mode> {
        self.active_modes()
            .into_iter()
            .filter(|r| {
                let seen = last_activity(r.name)
                    .map_or(r.activated_at, |t| t.max(r.activated_at));
                now - seen > max_idle
            })
            .map(|r| r.name)
            .collect()
    }
}

pub fn load(store: &dyn StateStore) -> anyhow::Result<RegistryState> {
    Ok(load_typed(store, keys::MODE_REGISTRY)?.unwrap_or_default())
}

pub fn activate(
    store: &dyn StateStore,
    mode: Mode,
    goal: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<Result<Activation, ActivationError>> {
    update_document(store, keys::MODE_REGISTRY, |r: &mut RegistryState| {
        r.activate(mode, goal, now)
    })
}

pub fn deactivate(
    store: &dyn StateStore,
    mode: Mode,
    outcome: ModeOutcome,
    set_cooldown: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<ModeHistoryEntry>> {
    modify_document(store, keys::MODE_REGISTRY, |r: &mut RegistryState| {
        r.deactivate(mode, outcome, set_cooldown, now)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn t0() -> DateTime<Utc> {
        "2025-03-01T12:00:00Z".parse().unwrap()
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    #[test]
    fn conflicting_mode_is_rejected() {
        let mut r = RegistryState::default();
        r.activate(Mode::Autopilot, None, t0()).unwrap();
        let err = r.activate(Mode::Ralph, None, t0()).unwrap_err();
        assert_eq!(
            err,
            ActivationError::Conflict {
                requested: Mode::Ralph,
                active: Mode::Autopilot
            }
        );
        assert_eq!(r.active.as_ref().unwrap().name, Mode::Autopilot);
    }

    #[test]
    fn deactivate_without_cooldown_frees_slot_immediately() {
        let mut r = RegistryState::default();
        r.activate(Mode::Autopilot, None, t0()).unwrap();
        r.deactivate(Mode::Autopilot, ModeOutcome::Success, false, t0());
        assert_eq!(r.activate(Mode::Ralph, None, t0()), Ok(Activation::Activated));
    }

    #[test]
    fn cooldown_blocks_same_mode_for_thirty_seconds() {
        let mut r = RegistryState::default();
        r.activate(Mode::Autopilot, Some("ship it"), t0()).unwrap();
        r.deactivate(Mode::Autopilot, ModeOutcome::Cancelled, true, t0());

        let err = r.activate(Mode::Autopilot, None, t0() + secs(10)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "mode 'autopilot' was recently cancelled, wait 20s before reactivating"
        );

        // Other modes are not blocked by the sentinel.
        assert!(r.activate(Mode::Ralph, None, t0() + secs(1)).is_ok());
        r.deactivate(Mode::Ralph, ModeOutcome::Success, false, t0() + secs(2));

        assert_eq!(
            r.activate(Mode::Autopilot, None, t0() + secs(30)),
            Ok(Activation::Activated)
        );
    }

    #[test]
    fn cooldown_wait_rounds_up() {
        let mut r = RegistryState::default();
        r.activate(Mode::Ralph, None, t0()).unwrap();
        r.deactivate(Mode::Ralph, ModeOutcome::Cancelled, true, t0());
        let err = r
            .activate(Mode::Ralph, None, t0() + TimeDelta::milliseconds(29_500))
            .unwrap_err();
        assert_eq!(
            err,
            ActivationError::Cooldown {
                mode: Mode::Ralph,
                remaining_secs: 1
            }
        );
    }

    #[test]
    fn cooldown_checked_before_conflict() {
        let mut r = RegistryState::default();
        r.activate(Mode::Ralph, None, t0()).unwrap();
        r.deactivate(Mode::Ralph, ModeOutcome::Cancelled, true, t0());
        r.activate(Mode::Pipeline, None, t0()).unwrap();
        assert!(matches!(
            r.activate(Mode::Ralph, None, t0() + secs(1)),
            Err(ActivationError::Cooldown { .. })
        ));
    }

    #[test]
    fn activating_active_mode_is_idempotent() {
        let mut r = RegistryState::default();
        r.activate(Mode::Ralph, Some("first"), t0()).unwrap();
        assert_eq!(
            r.activate(Mode::Ralph, Some("second"), t0() + secs(5)),
            Ok(Activation::AlreadyActive)
        );
        let active = r.active.as_ref().unwrap();
        assert_eq!(active.goal.as_deref(), Some("first"));
        assert_eq!(active.activated_at, t0());
    }

    #[test]
    fn companions_do_not_displace_exclusive_mode() {
        let mut r = RegistryState::default();
        r.activate(Mode::Pipeline, None, t0()).unwrap();
        r.activate(Mode::Team, None, t0()).unwrap();
        r.activate(Mode::Swarm, None, t0()).unwrap();
        let names: Vec<Mode> = r.active_modes().iter().map(|m| m.name).collect();
        assert_eq!(names, vec![Mode::Pipeline, Mode::Team, Mode::Swarm]);
        assert_eq!(r.activate(Mode::Team, None, t0()), Ok(Activation::AlreadyActive));
        assert!(r.deactivate(Mode::Team, ModeOutcome::Success, false, t0()).is_some());
        assert!(!r.is_active(Mode::Team));
        assert!(r.is_active(Mode::Pipeline));
    }

    #[test]
    fn deactivate_inactive_mode_is_noop() {
        let mut r = RegistryState::default();
        r.activate(Mode::Ralph, None, t0()).unwrap();
        assert!(r.deactivate(Mode::Autopilot, ModeOutcome::Failed, true, t0()).is_none());
        assert!(r.history.is_empty());
        assert!(r.sentinels.is_empty());
        assert!(r.is_active(Mode::Ralph));
    }

    #[test]
    fn history_is_capped_at_fifty() {
        let mut r = RegistryState::default();
        for i in 0..60 {
            let at = t0() + secs(i);
            r.activate(Mode::Qa, Some(&format!("run {i}")), at).unwrap();
            r.deactivate(Mode::Qa, ModeOutcome::Success, false, at);
        }
        assert_eq!(r.history.len(), HISTORY_LIMIT);
        assert_eq!(r.history[0].goal.as_deref(), Some("run 10"));
        assert_eq!(r.history[49].goal.as_deref(), Some("run 59"));
    }

    #[test]
    fn stale_modes_use_latest_activity() {
        let mut r = RegistryState::default();
        r.activate(Mode::Ralph, None, t0()).unwrap();
        r.activate(Mode::Swarm, None, t0()).unwrap();
        let now = t0() + TimeDelta::minutes(200);
        let stale = r.stale_modes(
            TimeDelta::minutes(120),
            |m| (m == Mode::Swarm).then(|| now - TimeDelta::minutes(5)),
            now,
        );
        assert_eq!(stale, vec![Mode::Ralph]);
    }

    #[test]
    fn persisted_activation_result_shape() {
        let store = MemoryStore::new();
        let ok = activate(&store, Mode::Autopilot, None, t0()).unwrap();
        let refused = activate(&store, Mode::Ralph, None, t0()).unwrap();
        assert_eq!(
            serde_json::to_value(ActivationResult::from(&ok)).unwrap(),
            serde_json::json!({"success": true})
        );
        let refused = ActivationResult::from(&refused);
        assert!(!refused.success);
        assert!(refused.error.unwrap().contains("conflicts"));

        let entry = deactivate(&store, Mode::Autopilot, ModeOutcome::Success, false, t0())
            .unwrap()
            .unwrap();
        assert_eq!(entry.outcome, ModeOutcome::Success);
        assert!(load(&store).unwrap().active.is_none());
    }
}
