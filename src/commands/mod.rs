pub mod autopilot;
pub mod hooks;
pub mod mode;
pub mod pipeline;
pub mod ralph;
pub mod schema;
pub mod status;
pub mod swarm;
pub mod team;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use crate::config::Config;
use crate::error::{ExitError, TransitionError};
use crate::modes::registry::ActivationError;
use crate::state::FileStore;

/// Output format for status-style commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// The explicit choice, else pretty on a terminal and text otherwise.
    pub fn resolve(choice: Option<OutputFormat>) -> OutputFormat {
        choice.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                OutputFormat::Pretty
            } else {
                OutputFormat::Text
            }
        })
    }

    /// Print a Markdown report, or `data` as JSON.
    pub fn print(self, markdown: &str, data: &impl Serialize) -> anyhow::Result<()> {
        match self {
            OutputFormat::Pretty => termimad::print_text(markdown),
            OutputFormat::Text => {
                print!("{markdown}");
                if !markdown.ends_with('\n') {
                    println!();
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
        }
        Ok(())
    }
}

/// Project root, config and state store shared by every command.
pub struct Workspace {
    pub root: PathBuf,
    pub config: Config,
    pub store: FileStore,
}

impl Workspace {
    pub fn open(project_root: Option<&Path>) -> anyhow::Result<Self> {
        let root = resolve_project_root(project_root)?;
        let config = Config::load_or_default(&root)?;
        let store = FileStore::new(config.state_dir(&root));
        Ok(Self {
            root,
            config,
            store,
        })
    }
}

pub fn resolve_project_root(project_root: Option<&Path>) -> anyhow::Result<PathBuf> {
    let path = match project_root {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir().context("could not determine current directory")?,
    };
    path.canonicalize()
        .with_context(|| format!("resolving project root: {}", path.display()))
}

/// Unwrap a state transition, turning a rejection into a CLI error.
pub(crate) fn applied<T>(
    result: anyhow::Result<Result<T, TransitionError>>,
) -> anyhow::Result<T> {
    result?.map_err(|e| ExitError::Rejected(e.to_string()).into())
}

/// Unwrap a mode activation, turning a conflict or cooldown into a CLI error.
pub(crate) fn activated<T>(
    result: anyhow::Result<Result<T, ActivationError>>,
) -> anyhow::Result<T> {
    result?.map_err(|e| ExitError::Rejected(e.to_string()).into())
}

/// Read a text argument that may be `-` for stdin.
pub(crate) fn read_text_arg(value: &str) -> anyhow::Result<String> {
    if value != "-" {
        return Ok(value.to_string());
    }
    use std::io::Read;
    let mut buf = String::new();
    std::io::stdin()
        .take(1024 * 1024)
        .read_to_string(&mut buf)
        .context("reading stdin")?;
    Ok(buf)
}
