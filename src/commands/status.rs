use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Workspace};
use crate::modes::registry::{self, RegistryState};
use crate::modes::{self, Mode, ModeSnapshot};
use crate::rails::circuit_breaker::{self, CircuitBreakerEntry};
use crate::rails::trust::{self, TrustState};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

/// Registry slots, cooldowns and every mode that has a document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub active: Vec<ActiveSummary>,
    pub cooldowns: Vec<CooldownSummary>,
    pub modes: Vec<ModeSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSummary {
    pub mode: Mode,
    pub exclusive: bool,
    pub activated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownSummary {
    pub mode: Mode,
    pub remaining_ms: u64,
}

impl StatusReport {
    fn build(reg: &RegistryState, modes: Vec<ModeSnapshot>, now: DateTime<Utc>) -> Self {
        let active = reg
            .active_modes()
            .into_iter()
            .map(|r| ActiveSummary {
                mode: r.name,
                exclusive: r.name.is_exclusive(),
                activated_at: r.activated_at,
                goal: r.goal.clone(),
            })
            .collect();
        let cooldowns = reg
            .sentinels
            .iter()
            .filter_map(|s| {
                s.remaining_ms(now).map(|remaining_ms| CooldownSummary {
                    mode: s.cancelled_mode,
                    remaining_ms,
                })
            })
            .collect();
        Self {
            active,
            cooldowns,
            modes,
        }
    }

    fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# modegate status");
        let _ = writeln!(out);
        if self.active.is_empty() {
            let _ = writeln!(out, "No mode is active.");
        } else {
            let _ = writeln!(out, "## Active");
            let _ = writeln!(out);
            for a in &self.active {
                let kind = if a.exclusive { "exclusive" } else { "companion" };
                let _ = write!(
                    out,
                    "- **{}** ({kind}) since {}",
                    a.mode,
                    a.activated_at.format("%H:%M")
                );
                if let Some(goal) = &a.goal {
                    let _ = write!(out, ": {goal}");
                }
                let _ = writeln!(out);
            }
        }
        if !self.cooldowns.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Cooldowns");
            let _ = writeln!(out);
            for c in &self.cooldowns {
                let _ = writeln!(out, "- {}: {}s left", c.mode, c.remaining_ms.div_ceil(1000));
            }
        }
        if !self.modes.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "## Documents");
            let _ = writeln!(out);
            for m in &self.modes {
                let state = if m.active { "active" } else { "idle" };
                let _ = writeln!(out, "- {} [{state}] {}", m.mode, m.line);
            }
        }
        out
    }
}

impl StatusArgs {
    pub fn execute(&self, project_root: Option<&Path>) -> anyhow::Result<()> {
        let ws = Workspace::open(project_root)?;
        let reg = registry::load(&ws.store)?;
        let mut snapshots = Vec::new();
        for mode in Mode::ALL {
            if let Some(snap) = modes::snapshot(&ws.store, mode)? {
                snapshots.push(snap);
            }
        }
        let report = StatusReport::build(&reg, snapshots, Utc::now());
        OutputFormat::resolve(self.format).print(&report.to_markdown(), &report)
    }
}

/// Circuit breaker counters and the trust ledger.
#[derive(Debug, Args)]
pub struct RailsArgs {
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RailsReport {
    pub failures: Vec<CircuitBreakerEntry>,
    pub trust: TrustState,
    pub trust_scope: &'static str,
}

impl RailsReport {
    fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Safety rails");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Trust level **{}**: {} ({} clean edits in a row)",
            self.trust.level, self.trust_scope, self.trust.consecutive_successes
        );
        let _ = writeln!(out);
        if self.failures.is_empty() {
            let _ = writeln!(out, "No recent tool failures.");
            return out;
        }
        let _ = writeln!(out, "| Tool | Failures | Last error |");
        let _ = writeln!(out, "|---|---|---|");
        for f in &self.failures {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                f.tool,
                f.count,
                modes::excerpt(&f.last_error, 80).replace('|', "\\|")
            );
        }
        out
    }
}

impl RailsArgs {
    pub fn execute(&self, project_root: Option<&Path>) -> anyhow::Result<()> {
        let ws = Workspace::open(project_root)?;
        let now = Utc::now();
        let breaker = circuit_breaker::load(&ws.store)?;
        let trust = trust::load(&ws.store)?;
        let report = RailsReport {
            failures: breaker.live_entries(now).into_iter().cloned().collect(),
            trust_scope: trust.describe(),
            trust,
        };
        OutputFormat::resolve(self.format).print(&report.to_markdown(), &report)
    }
}
