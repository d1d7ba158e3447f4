//! Per-tool consecutive failure counter with escalating advice.
//!
//! A tool that keeps failing gets progressively stronger advisory text: first
//! to try a stronger model or smaller steps, then to change approach, and
//! finally to stop and ask the user. A single success clears the tool.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::{StateStore, keys, load_typed, modify_document};

/// Failures older than this no longer count toward the streak.
pub const RESET_WINDOW_MINS: i64 = 30;

pub const MODEL_TIER_THRESHOLD: u32 = 3;
pub const DIFFERENT_APPROACH_THRESHOLD: u32 = 5;
pub const ASK_USER_THRESHOLD: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerEntry {
    pub tool: String,
    pub count: u32,
    pub last_error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    #[serde(default)]
    pub entries: BTreeMap<String, CircuitBreakerEntry>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// What a recorded failure amounted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub count: u32,
    pub escalation: Option<String>,
}

impl CircuitBreakerState {
    pub fn record_failure(&mut self, tool: &str, error: &str, now: DateTime<Utc>) -> FailureRecord {
        let window = TimeDelta::minutes(RESET_WINDOW_MINS);
        let count = match self.entries.get(tool) {
            Some(entry) if now - entry.timestamp <= window => entry.count.saturating_add(1),
            _ => 1,
        };
        self.entries.insert(
            tool.to_string(),
            CircuitBreakerEntry {
                tool: tool.to_string(),
                count,
                last_error: error.to_string(),
                timestamp: now,
            },
        );
        self.last_activity_at = Some(now);

        let escalation = escalation_for(tool, count, error);
        if escalation.is_some() {
            warn!(tool, count, "tool failure streak escalated");
        }
        FailureRecord { count, escalation }
    }

    /// Forget the tool entirely. Returns whether it had an entry.
    pub fn record_success(&mut self, tool: &str, now: DateTime<Utc>) -> bool {
        let removed = self.entries.remove(tool).is_some();
        if removed {
            info!(tool, "tool failure streak cleared");
            self.last_activity_at = Some(now);
        }
        removed
    }

    /// Current streak for a tool, ignoring entries that have aged out.
    pub fn failure_count(&self, tool: &str, now: DateTime<Utc>) -> u32 {
        self.entries
            .get(tool)
            .filter(|e| now - e.timestamp <= TimeDelta::minutes(RESET_WINDOW_MINS))
            .map_or(0, |e| e.count)
    }

    /// Entries still inside the reset window, highest count first.
    pub fn live_entries(&self, now: DateTime<Utc>) -> Vec<&CircuitBreakerEntry> {
        let window = TimeDelta::minutes(RESET_WINDOW_MINS);
        let mut live: Vec<&CircuitBreakerEntry> = self
            .entries
            .values()
            .filter(|e| now - e.timestamp <= window)
            .collect();
        live.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tool.cmp(&b.tool)));
        live
    }
}

/// Advisory text for a failure streak, `None` below the first threshold.
pub fn escalation_for(tool: &str, count: u32, last_error: &str) -> Option<String> {
    let advice = if count >= ASK_USER_THRESHOLD {
        "Stop retrying. Explain what you have tried and ask the user how to proceed, \
         or switch to a different strategy entirely."
    } else if count >= DIFFERENT_APPROACH_THRESHOLD {
        "Repeating the same fix is not working. Step back and take a fundamentally \
         different approach to the problem."
    } else if count >= MODEL_TIER_THRESHOLD {
        "Consider delegating to a more capable model tier, or break the change into \
         smaller steps."
    } else {
        return None;
    };

    let first_line = last_error.lines().map(str::trim).find(|l| !l.is_empty());
    Some(match first_line {
        Some(line) => format!("{tool} has failed {count} times in a row (last error: {line}). {advice}"),
        None => format!("{tool} has failed {count} times in a row. {advice}"),
    })
}

pub fn record_failure(
    store: &dyn StateStore,
    tool: &str,
    error: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<FailureRecord> {
    modify_document(store, keys::CIRCUIT_BREAKER, |s: &mut CircuitBreakerState| {
        s.record_failure(tool, error, now)
    })
}

pub fn record_success(store: &dyn StateStore, tool: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
    // Skip the write when there is nothing to clear; most successes hit this path.
    let state = load(store)?;
    if !state.entries.contains_key(tool) {
        return Ok(false);
    }
    modify_document(store, keys::CIRCUIT_BREAKER, |s: &mut CircuitBreakerState| {
        s.record_success(tool, now)
    })
}

pub fn load(store: &dyn StateStore) -> anyhow::Result<CircuitBreakerState> {
    Ok(load_typed(store, keys::CIRCUIT_BREAKER)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn t0() -> DateTime<Utc> {
        "2025-03-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn escalation_thresholds() {
        let mut state = CircuitBreakerState::default();
        let now = t0();
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(state.record_failure("Bash", "exit 1", now));
        }
        assert_eq!(seen[0].count, 1);
        assert!(seen[0].escalation.is_none());
        assert!(seen[1].escalation.is_none());
        for r in &seen[2..4] {
            assert!(r.escalation.as_deref().unwrap().contains("model tier"));
        }
        for r in &seen[4..6] {
            assert!(r.escalation.as_deref().unwrap().contains("fundamentally different"));
        }
        for r in &seen[6..8] {
            assert!(r.escalation.as_deref().unwrap().contains("ask the user"));
        }
    }

    #[test]
    fn escalation_mentions_tool_count_and_first_error_line() {
        let text = escalation_for("Bash", 3, "\n  error[E0308]: mismatched types\nsecond-line-detail").unwrap();
        assert!(text.starts_with("Bash has failed 3 times"));
        assert!(text.contains("error[E0308]: mismatched types"));
        assert!(!text.contains("second-line-detail"));
        assert!(escalation_for("Bash", 2, "x").is_none());
    }

    #[test]
    fn stale_entry_resets_to_one() {
        let mut state = CircuitBreakerState::default();
        state.record_failure("Edit", "a", t0());
        state.record_failure("Edit", "b", t0());
        let later = t0() + TimeDelta::minutes(31);
        let r = state.record_failure("Edit", "c", later);
        assert_eq!(r.count, 1);
        assert_eq!(state.entries["Edit"].last_error, "c");
    }

    #[test]
    fn failure_at_exactly_thirty_minutes_still_counts() {
        let mut state = CircuitBreakerState::default();
        state.record_failure("Edit", "a", t0());
        let r = state.record_failure("Edit", "b", t0() + TimeDelta::minutes(30));
        assert_eq!(r.count, 2);
    }

    #[test]
    fn success_always_removes_tool() {
        let mut state = CircuitBreakerState::default();
        for _ in 0..9 {
            state.record_failure("Bash", "x", t0());
        }
        state.record_failure("Edit", "x", t0());
        assert!(state.record_success("Bash", t0()));
        assert!(!state.entries.contains_key("Bash"));
        assert_eq!(state.failure_count("Edit", t0()), 1);
        assert!(!state.record_success("Bash", t0()));
    }

    #[test]
    fn tools_are_counted_independently() {
        let mut state = CircuitBreakerState::default();
        state.record_failure("Bash", "x", t0());
        state.record_failure("Bash", "x", t0());
        let r = state.record_failure("Write", "x", t0());
        assert_eq!(r.count, 1);
        assert_eq!(state.failure_count("Bash", t0()), 2);
        let live = state.live_entries(t0());
        assert_eq!(live[0].tool, "Bash");
    }

    #[test]
    fn persisted_round_trip() {
        let store = MemoryStore::new();
        record_failure(&store, "Bash", "boom", t0()).unwrap();
        let r = record_failure(&store, "Bash", "boom", t0()).unwrap();
        assert_eq!(r.count, 2);
        assert!(record_success(&store, "Bash", t0()).unwrap());
        assert!(load(&store).unwrap().entries.is_empty());
        assert!(!record_success(&store, "Grep", t0()).unwrap());
    }

    #[test]
    fn document_uses_camel_case() {
        let mut state = CircuitBreakerState::default();
        state.record_failure("Bash", "x", t0());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["entries"]["Bash"]["lastError"], "x");
        assert!(json["lastActivityAt"].is_string());
    }
}
