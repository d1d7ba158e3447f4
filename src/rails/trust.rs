//! Progressive autonomy ratchet.
//!
//! Level 0 asks for everything. Five consecutive successful edits earn level 1,
//! a passing build at level 1 earns level 2 and a passing test run at level 2
//! earns level 3. Failures reset the edit streak but never lower the level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::heuristics::CommandClass;
use crate::state::{StateStore, keys, load_typed, modify_document};

pub const MAX_LEVEL: u8 = 3;
pub const SUCCESSES_FOR_LEVEL_ONE: u32 = 5;

/// Tools whose successes count toward level 1 and which level 1 auto-approves.
pub const EDIT_CLASS_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

pub fn is_edit_class(tool: &str) -> bool {
    EDIT_CLASS_TOOLS.contains(&tool)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustState {
    #[serde(default)]
    pub level: u8,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub build_passed: bool,
    #[serde(default)]
    pub tests_passed: bool,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl TrustState {
    /// Count an Edit/Write-class success. Other tools are ignored.
    /// Returns the new level when it changed.
    pub fn record_success(&mut self, tool: &str, now: DateTime<Utc>) -> Option<u8> {
        if !is_edit_class(tool) {
            return None;
        }
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.last_activity_at = Some(now);
        if self.level == 0 && self.consecutive_successes >= SUCCESSES_FOR_LEVEL_ONE {
            return self.raise_to(1);
        }
        None
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_successes = 0;
        self.last_activity_at = Some(now);
    }

    pub fn record_build_pass(&mut self, now: DateTime<Utc>) -> Option<u8> {
        self.build_passed = true;
        self.last_activity_at = Some(now);
        if self.level == 1 {
            return self.raise_to(2);
        }
        None
    }

    pub fn record_test_pass(&mut self, now: DateTime<Utc>) -> Option<u8> {
        self.tests_passed = true;
        self.last_activity_at = Some(now);
        if self.level == 2 {
            return self.raise_to(3);
        }
        None
    }

    fn raise_to(&mut self, level: u8) -> Option<u8> {
        if level <= self.level || level > MAX_LEVEL {
            return None;
        }
        info!(from = self.level, to = level, "trust level raised");
        self.level = level;
        Some(level)
    }

    /// Why a tool call may run without asking, or `None` to defer to the host.
    pub fn auto_approval(&self, tool: &str, command: Option<CommandClass>) -> Option<String> {
        if self.level >= 1 && is_edit_class(tool) {
            return Some(format!("trust level {}: file edits are auto-approved", self.level));
        }
        match command {
            Some(CommandClass::Build) if self.level >= 2 => Some(format!(
                "trust level {}: build commands are auto-approved",
                self.level
            )),
            Some(CommandClass::Test) if self.level >= 3 => Some(format!(
                "trust level {}: test commands are auto-approved",
                self.level
            )),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self.level {
            0 => "every action needs approval",
            1 => "file edits auto-approved",
            2 => "file edits and builds auto-approved",
            _ => "file edits, builds and tests auto-approved",
        }
    }
}

pub fn load(store: &dyn StateStore) -> anyhow::Result<TrustState> {
    Ok(load_typed(store, keys::TRUST)?.unwrap_or_default())
}

/// Apply one change to the persisted ledger.
pub fn update<R>(
    store: &dyn StateStore,
    apply: impl FnMut(&mut TrustState) -> R,
) -> anyhow::Result<R> {
    modify_document(store, keys::TRUST, apply)
}
