use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use tracing::error;

use super::{OutputFormat, Workspace, resolve_project_root};
use crate::error::ExitError;
use crate::heuristics::CommandClassifier;
use crate::hooks::{self, HookContext, HookEntry, HookEvent, HookOutput, HookRegistry};
use crate::shell;
use crate::subprocess::ShellRunner;
use crate::vcs::GitInspector;

/// Marker identifying settings.json entries modegate owns.
const MANAGED_MARKER: &str = "modegate hook ";

/// Payloads larger than this are truncated.
const MAX_PAYLOAD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Subcommand)]
pub enum HooksCommand {
    /// Write modegate's handlers into .claude/settings.json
    Install,
    /// Check that every handler is registered
    Audit {
        /// Output format
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },
}

impl HooksCommand {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        match self {
            HooksCommand::Install => install_hooks(project_root),
            HooksCommand::Audit { format } => {
                audit_hooks(project_root, OutputFormat::resolve(*format))
            }
        }
    }
}

/// Handle one lifecycle event: payload on stdin, decision on stdout.
#[derive(Debug, Args)]
pub struct HookArgs {
    /// Event name (session-start, pre-tool-use, post-tool-use, stop)
    #[arg(value_enum)]
    pub event: HookEvent,
}

impl HookArgs {
    pub fn execute(&self, project_root: Option<&Path>) -> Result<()> {
        let raw = {
            use std::io::Read;
            let mut buf = String::new();
            let mut handle = std::io::stdin().take(MAX_PAYLOAD_BYTES);
            if let Err(e) = handle.read_to_string(&mut buf) {
                error!(error = %e, "could not read hook payload");
                buf.clear();
            }
            buf
        };

        let output = match Workspace::open(project_root) {
            Ok(ws) => {
                let classifier = CommandClassifier::from_config(&ws.config.classifier);
                let vcs = GitInspector::new(&ws.root);
                let ctx = HookContext {
                    store: &ws.store,
                    config: &ws.config,
                    classifier: &classifier,
                    runner: &ShellRunner,
                    vcs: &vcs,
                    project_root: &ws.root,
                    now: Utc::now(),
                };
                hooks::handle(self.event, &raw, &ctx)
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "could not open workspace");
                HookOutput::neutral()
            }
        };
        println!("{}", serde_json::to_string(&output.to_json())?);
        Ok(())
    }
}

fn settings_path(root: &Path) -> std::path::PathBuf {
    root.join(".claude").join("settings.json")
}

fn install_hooks(project_root: Option<&Path>) -> Result<()> {
    let root = resolve_project_root(project_root)?;
    let path = settings_path(&root);

    let existing = if path.exists() {
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str::<Value>(&content)
            .with_context(|| format!("parsing {}", path.display()))?
    } else {
        json!({})
    };

    let settings = merge_hooks(existing, &HookRegistry::all(), &root);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&path, serde_json::to_string_pretty(&settings)? + "\n")
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Installed {} hooks into {}", HookRegistry::all().len(), path.display());
    Ok(())
}

fn hook_command(entry: &HookEntry, root: &Path) -> String {
    format!(
        "{} --project-root {}",
        entry.command(),
        shell::safe_ident(&root.display().to_string())
    )
}

fn is_managed(entry: &Value) -> bool {
    entry["hooks"].as_array().is_some_and(|hooks| {
        hooks.iter().any(|h| {
            h["command"]
                .as_str()
                .is_some_and(|cmd| cmd.contains(MANAGED_MARKER))
        })
    })
}

/// Replace modegate's entries per event, keeping everyone else's.
fn merge_hooks(mut settings: Value, entries: &[HookEntry], root: &Path) -> Value {
    if !settings.is_object() {
        settings = json!({});
    }
    let mut merged = settings
        .get("hooks")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for entry in entries {
        let event = entry.event.as_str();
        let mut combined: Vec<Value> = merged
            .get(event)
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter(|e| !is_managed(e)).cloned().collect())
            .unwrap_or_default();
        combined.push(json!({
            "matcher": entry.matcher,
            "hooks": [
                {
                    "type": "command",
                    "command": hook_command(entry, root),
                }
            ]
        }));
        merged.insert(event.to_string(), Value::Array(combined));
    }

    settings["hooks"] = Value::Object(merged);
    settings
}

/// Registered handlers that are missing from `settings`.
fn missing_hooks(settings: &Value, entries: &[HookEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| {
            let wanted = entry.command();
            !settings["hooks"][entry.event.as_str()]
                .as_array()
                .is_some_and(|arr| {
                    arr.iter().any(|e| {
                        e["hooks"].as_array().is_some_and(|hooks| {
                            hooks.iter().any(|h| {
                                h["command"].as_str().is_some_and(|c| c.starts_with(&wanted))
                            })
                        })
                    })
                })
        })
        .map(|entry| {
            format!(
                "{} handler not registered in settings.json",
                entry.event.as_str()
            )
        })
        .collect()
}

fn audit_hooks(project_root: Option<&Path>, format: OutputFormat) -> Result<()> {
    let root = resolve_project_root(project_root)?;
    let path = settings_path(&root);

    let issues = if path.exists() {
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<Value>(&content) {
            Ok(settings) => missing_hooks(&settings, &HookRegistry::all()),
            Err(e) => vec![format!("{} is not valid JSON: {e}", path.display())],
        }
    } else {
        vec!["Missing .claude/settings.json".to_string()]
    };

    match format {
        OutputFormat::Json => {
            let result = json!({
                "issues": issues,
                "status": if issues.is_empty() { "ok" } else { "issues_found" }
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Pretty | OutputFormat::Text => {
            if issues.is_empty() {
                println!("✓ All hooks configured correctly");
            } else {
                eprintln!("Hook audit found {} issue(s):", issues.len());
                for issue in &issues {
                    eprintln!("  - {issue}");
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ExitError::AuditFailed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_foreign_hooks() {
        let existing = json!({
            "hooks": {
                "Stop": [
                    {
                        "matcher": "",
                        "hooks": [{"type": "command", "command": "my-custom-hook"}]
                    },
                    {
                        "matcher": "",
                        "hooks": [{"type": "command", "command": "modegate hook stop --project-root /old"}]
                    }
                ]
            },
            "permissions": {"allow": ["Bash(ls:*)"]}
        });

        let merged = merge_hooks(existing, &HookRegistry::all(), Path::new("/work/proj"));
        let stop = merged["hooks"]["Stop"].as_array().unwrap();
        assert_eq!(stop.len(), 2);
        assert_eq!(stop[0]["hooks"][0]["command"], "my-custom-hook");
        assert_eq!(
            stop[1]["hooks"][0]["command"],
            "modegate hook stop --project-root /work/proj"
        );
        assert_eq!(merged["permissions"]["allow"][0], "Bash(ls:*)");
        for event in HookEvent::ALL {
            assert!(merged["hooks"][event.as_str()].is_array(), "{}", event.as_str());
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let root = Path::new("/p");
        let once = merge_hooks(json!({}), &HookRegistry::all(), root);
        let twice = merge_hooks(once.clone(), &HookRegistry::all(), root);
        assert_eq!(once, twice);
    }

    #[test]
    fn project_root_with_spaces_is_quoted() {
        let entry = HookEntry {
            event: HookEvent::Stop,
            matcher: "",
        };
        assert_eq!(
            hook_command(&entry, Path::new("/my proj")),
            "modegate hook stop --project-root '/my proj'"
        );
    }

    #[test]
    fn audit_reports_missing_events() {
        let settings = merge_hooks(json!({}), &HookRegistry::all(), Path::new("/p"));
        assert!(missing_hooks(&settings, &HookRegistry::all()).is_empty());

        let mut partial = settings;
        partial["hooks"]
            .as_object_mut()
            .unwrap()
            .remove("PreToolUse");
        let issues = missing_hooks(&partial, &HookRegistry::all());
        assert_eq!(issues, vec!["PreToolUse handler not registered in settings.json"]);
    }
}
