use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Config file name constants.
pub const CONFIG_TOML: &str = ".modegate.toml";
pub const CONFIG_JSON: &str = ".modegate.json";

/// Environment variable that overrides the state directory.
pub const STATE_DIR_ENV: &str = "MODEGATE_STATE_DIR";

/// Find the config file path, preferring .modegate.toml over .modegate.json.
/// Returns None if neither exists.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let toml_path = dir.join(CONFIG_TOML);
    if toml_path.exists() {
        return Some(toml_path);
    }
    let json_path = dir.join(CONFIG_JSON);
    if json_path.exists() {
        return Some(json_path);
    }
    None
}

/// Top-level .modegate.toml config.
///
/// Every section is optional. A project without a config file runs with the
/// defaults below, which is what hooks rely on: they must work before anyone
/// has written a config.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub ralph: RalphConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub team: TeamConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StateConfig {
    /// State directory, relative to the project root unless absolute.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Minutes without activity after which an active mode is considered abandoned.
    #[serde(default = "default_stale_after_mins", alias = "staleAfterMins")]
    pub stale_after_mins: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            stale_after_mins: default_stale_after_mins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RalphConfig {
    #[serde(default = "default_max_iterations", alias = "maxIterations")]
    pub max_iterations: u32,
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    #[serde(default = "default_max_fix_attempts", alias = "maxFixAttempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_gate_timeout", alias = "gateTimeoutSecs")]
    pub gate_timeout_secs: u64,
    /// Verification gates, run in order during the verify stage.
    #[serde(default)]
    pub gates: Vec<GateConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_fix_attempts: default_max_fix_attempts(),
            gate_timeout_secs: default_gate_timeout(),
            gates: Vec::new(),
        }
    }
}

/// One verification gate: a shell command that must (or should) succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GateConfig {
    pub label: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AutopilotConfig {
    #[serde(
        default = "default_max_consecutive_failures",
        alias = "maxConsecutiveFailures"
    )]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_tasks_before_review", alias = "maxTasksBeforeReview")]
    pub max_tasks_before_review: u32,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            max_tasks_before_review: default_max_tasks_before_review(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SwarmConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TeamConfig {
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default = "default_base_branch", alias = "baseBranch")]
    pub base_branch: String,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            base_branch: default_base_branch(),
        }
    }
}

/// Regex lists used to recognise build and test shell commands. Patterns are
/// matched against each trimmed simple command of a command line.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassifierConfig {
    #[serde(default = "default_build_patterns", alias = "buildPatterns")]
    pub build_patterns: Vec<String>,
    #[serde(default = "default_test_patterns", alias = "testPatterns")]
    pub test_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            build_patterns: default_build_patterns(),
            test_patterns: default_test_patterns(),
        }
    }
}

fn default_stale_after_mins() -> u64 { 120 }
fn default_max_iterations() -> u32 { 10 }
fn default_max_fix_attempts() -> u32 { 3 }
fn default_gate_timeout() -> u64 { 60 }
fn default_true() -> bool { true }
fn default_max_consecutive_failures() -> u32 { 3 }
fn default_max_tasks_before_review() -> u32 { 5 }
fn default_concurrency() -> u32 { 3 }
fn default_workers() -> u32 { 2 }
fn default_base_branch() -> String { "main".into() }

fn default_build_patterns() -> Vec<String> {
    vec![
        r"^cargo\s+(build|check|clippy)\b".into(),
        r"^(npm|pnpm|yarn|bun)\s+(run\s+)?build\b".into(),
        r"^(npx\s+)?tsc\b".into(),
        r"^go\s+(build|vet)\b".into(),
        r"^make(\s|$)".into(),
        r"^mvn\s+(compile|package)\b".into(),
        r"^(\./)?gradlew?\s+(build|assemble)\b".into(),
    ]
}

fn default_test_patterns() -> Vec<String> {
    vec![
        r"^cargo\s+(test|nextest)\b".into(),
        r"^(npm|pnpm|yarn|bun)\s+(run\s+)?test\b".into(),
        r"^pytest\b".into(),
        r"^python3?\s+-m\s+(pytest|unittest)\b".into(),
        r"^go\s+test\b".into(),
        r"^(npx\s+)?(jest|vitest)\b".into(),
        r"^mvn\s+test\b".into(),
        r"^(\./)?gradlew?\s+test\b".into(),
    ]
}

impl Config {
    /// Load config from a file (TOML or JSON, auto-detected by extension).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_toml(&contents).or_else(|_| Self::parse_json(&contents)),
        }
    }

    /// Load the project's config, or defaults when the project has none.
    pub fn load_or_default(project_root: &Path) -> anyhow::Result<Self> {
        match find_config(project_root) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_TOML}: {e}")).into())
    }

    /// Parse config from a JSON string.
    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_JSON}: {e}")).into())
    }

    /// Resolve the state directory: `$MODEGATE_STATE_DIR`, then `state.dir`,
    /// then `<project>/.modegate/state`.
    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV)
            && !dir.trim().is_empty()
        {
            return PathBuf::from(dir);
        }
        match &self.state.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_root.join(dir),
            None => project_root.join(".modegate").join("state"),
        }
    }
}
