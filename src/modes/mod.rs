//! Mode state machines.
//!
//! Each mode owns one persisted document. Transitions are methods on the
//! document type taking an explicit `now`; the free functions in each module
//! wrap them in a load → apply → compare-and-swap cycle.

pub mod autopilot;
pub mod pipeline;
pub mod ralph;
pub mod registry;
pub mod swarm;
pub mod team;

use std::fmt;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::state::{StateStore, load_typed, modify_document, update_document};
use self::registry::{Activation, ActivationError};

/// Execution strategies an agent session can run under.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ralph,
    Autopilot,
    Pipeline,
    Qa,
    Ralplan,
    Team,
    Swarm,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::Ralph,
        Mode::Autopilot,
        Mode::Pipeline,
        Mode::Qa,
        Mode::Ralplan,
        Mode::Team,
        Mode::Swarm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Ralph => "ralph",
            Mode::Autopilot => "autopilot",
            Mode::Pipeline => "pipeline",
            Mode::Qa => "qa",
            Mode::Ralplan => "ralplan",
            Mode::Team => "team",
            Mode::Swarm => "swarm",
        }
    }

    /// Exclusive modes occupy the single active slot. Team and swarm compose
    /// with anything.
    pub fn is_exclusive(self) -> bool {
        !matches!(self, Mode::Team | Mode::Swarm)
    }

    /// Symmetric conflict table: two distinct exclusive modes conflict.
    pub fn conflicts_with(self, other: Mode) -> bool {
        self != other && self.is_exclusive() && other.is_exclusive()
    }

    /// Modes that own a state machine in this crate.
    pub fn has_document(self) -> bool {
        !matches!(self, Mode::Qa | Mode::Ralplan)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a mode run ended, recorded in the registry history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModeOutcome {
    Success,
    Failed,
    Cancelled,
    Aborted,
    Stale,
}

impl ModeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ModeOutcome::Success => "success",
            ModeOutcome::Failed => "failed",
            ModeOutcome::Cancelled => "cancelled",
            ModeOutcome::Aborted => "aborted",
            ModeOutcome::Stale => "stale",
        }
    }
}

impl fmt::Display for ModeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the host should do after a Stop event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep working; the string is injected as the next instruction.
    Continue(String),
    /// Let the agent stop, optionally with a message for the user.
    AllowStop(Option<String>),
    /// Halt the session with a reason.
    Abort(String),
}

impl ControlSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlSignal::Continue(_) => "continue",
            ControlSignal::AllowStop(_) => "allow-stop",
            ControlSignal::Abort(_) => "abort",
        }
    }
}

/// Shared surface of every mode document.
pub trait ModeDocument: Serialize + DeserializeOwned + Default {
    const MODE: Mode;
    const KEY: &'static str;

    fn is_active(&self) -> bool;

    fn last_activity_at(&self) -> Option<DateTime<Utc>>;

    /// How the run ended, for the registry history once inactive.
    fn outcome(&self) -> ModeOutcome;

    /// Stop the run from outside (cancel, stale expiry).
    fn halt(&mut self, outcome: ModeOutcome, now: DateTime<Utc>);

    /// One-line summary for status listings.
    fn status_line(&self) -> String;

    /// Multi-line Markdown report.
    fn status_report(&self) -> String;

    /// Instructions injected into the agent's next turn.
    fn context_block(&self) -> anyhow::Result<String>;
}

pub fn load_document<T: ModeDocument>(store: &dyn StateStore) -> anyhow::Result<T> {
    Ok(load_typed(store, T::KEY)?.unwrap_or_default())
}

/// Claim the registry slot for `T::MODE` and persist a fresh document.
///
/// When the mode is already active the existing document is kept and
/// returned unchanged.
pub fn start_document<T: ModeDocument>(
    store: &dyn StateStore,
    doc: T,
    goal: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<Result<(T, Activation), ActivationError>> {
    let activation = match registry::activate(store, T::MODE, goal, now)? {
        Ok(a) => a,
        Err(e) => return Ok(Err(e)),
    };
    let body = serde_json::to_value(&doc).context("encoding mode document")?;
    let kept = update_document(store, T::KEY, |current: &mut serde_json::Value| {
        if activation == Activation::AlreadyActive && !current.is_null() {
            let existing: T = serde_json::from_value(current.clone())?;
            if existing.is_active() {
                return Ok(Some(existing));
            }
        }
        current.clone_from(&body);
        Ok::<_, serde_json::Error>(None)
    })?
    .context("decoding mode document")?;
    Ok(Ok((kept.unwrap_or(doc), activation)))
}

/// Apply one transition to a mode document. When it ends the run, the
/// registry slot is released with the document's outcome.
pub fn transition<T, R, F>(
    store: &dyn StateStore,
    now: DateTime<Utc>,
    mut apply: F,
) -> anyhow::Result<Result<R, TransitionError>>
where
    T: ModeDocument,
    F: FnMut(&mut T) -> Result<R, TransitionError>,
{
    let mut ended = None;
    let result = update_document(store, T::KEY, |doc: &mut T| {
        ended = None;
        let was_active = doc.is_active();
        let r = apply(doc)?;
        if was_active && !doc.is_active() {
            ended = Some(doc.outcome());
        }
        Ok(r)
    })?;
    if let Some(outcome) = ended {
        registry::deactivate(store, T::MODE, outcome, false, now)?;
    }
    Ok(result)
}

fn halt_document<T: ModeDocument>(
    store: &dyn StateStore,
    outcome: ModeOutcome,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    if !load_document::<T>(store)?.is_active() {
        return Ok(());
    }
    modify_document(store, T::KEY, |doc: &mut T| {
        if doc.is_active() {
            doc.halt(outcome, now);
        }
    })
}

/// End a mode from outside its own machine: mark its document inactive and
/// release the registry slot. Returns whether the registry had it active.
pub fn halt_mode(
    store: &dyn StateStore,
    mode: Mode,
    outcome: ModeOutcome,
    set_cooldown: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    match mode {
        Mode::Ralph => halt_document::<ralph::RalphState>(store, outcome, now)?,
        Mode::Pipeline => halt_document::<pipeline::PipelineState>(store, outcome, now)?,
        Mode::Autopilot => halt_document::<autopilot::AutopilotState>(store, outcome, now)?,
        Mode::Swarm => halt_document::<swarm::SwarmState>(store, outcome, now)?,
        Mode::Team => halt_document::<team::TeamState>(store, outcome, now)?,
        Mode::Qa | Mode::Ralplan => {}
    }
    Ok(registry::deactivate(store, mode, outcome, set_cooldown, now)?.is_some())
}

/// Liveness of a mode's persisted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentStatus {
    pub active: bool,
    pub outcome: ModeOutcome,
    pub last_activity_at: Option<DateTime<Utc>>,
}

fn status_of<T: ModeDocument>(store: &dyn StateStore) -> anyhow::Result<DocumentStatus> {
    let doc: T = load_document(store)?;
    Ok(DocumentStatus {
        active: doc.is_active(),
        outcome: doc.outcome(),
        last_activity_at: doc.last_activity_at(),
    })
}

/// `None` for modes without a document.
pub fn document_status(store: &dyn StateStore, mode: Mode) -> anyhow::Result<Option<DocumentStatus>> {
    Ok(Some(match mode {
        Mode::Ralph => status_of::<ralph::RalphState>(store)?,
        Mode::Pipeline => status_of::<pipeline::PipelineState>(store)?,
        Mode::Autopilot => status_of::<autopilot::AutopilotState>(store)?,
        Mode::Swarm => status_of::<swarm::SwarmState>(store)?,
        Mode::Team => status_of::<team::TeamState>(store)?,
        Mode::Qa | Mode::Ralplan => return Ok(None),
    }))
}

/// Rendered view of one mode's document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSnapshot {
    pub mode: Mode,
    pub active: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub line: String,
    #[serde(skip)]
    pub report: String,
    #[serde(skip)]
    pub context: Option<String>,
    pub document: serde_json::Value,
}

fn snapshot_of<T: ModeDocument>(store: &dyn StateStore) -> anyhow::Result<Option<ModeSnapshot>> {
    let Some(doc) = load_typed::<T>(store, T::KEY)? else {
        return Ok(None);
    };
    let context = if doc.is_active() {
        Some(doc.context_block()?)
    } else {
        None
    };
    Ok(Some(ModeSnapshot {
        mode: T::MODE,
        active: doc.is_active(),
        last_activity_at: doc.last_activity_at(),
        line: doc.status_line(),
        report: doc.status_report(),
        context,
        document: serde_json::to_value(&doc).context("encoding mode document")?,
    }))
}

/// Snapshot of a mode's document, `None` for modes without one or never started.
pub fn snapshot(store: &dyn StateStore, mode: Mode) -> anyhow::Result<Option<ModeSnapshot>> {
    match mode {
        Mode::Ralph => snapshot_of::<ralph::RalphState>(store),
        Mode::Pipeline => snapshot_of::<pipeline::PipelineState>(store),
        Mode::Autopilot => snapshot_of::<autopilot::AutopilotState>(store),
        Mode::Swarm => snapshot_of::<swarm::SwarmState>(store),
        Mode::Team => snapshot_of::<team::TeamState>(store),
        Mode::Qa | Mode::Ralplan => Ok(None),
    }
}

/// Context block for a transition result; rendering failures surface as
/// transition errors so no state is written.
pub(crate) fn render_context<T: ModeDocument>(doc: &T) -> Result<String, TransitionError> {
    doc.context_block()
        .map_err(|e| TransitionError::Invalid(format!("rendering {} context: {e:#}", T::MODE)))
}

/// Truncate `text` to at most `max` characters, marking the cut.
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}
