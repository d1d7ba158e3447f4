//! modegate - mode orchestration and safety rails for autonomous coding agent sessions

pub mod commands;
pub mod config;
pub mod error;
pub mod heuristics;
pub mod hooks;
pub mod modes;
pub mod rails;
pub mod shell;
pub mod state;
pub mod subprocess;
pub mod telemetry;
pub mod template;
pub mod vcs;
