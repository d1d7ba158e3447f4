//! Version-control inspection used by team merge planning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::subprocess::Tool;

/// Answers "which files differ between two refs".
pub trait VcsInspector {
    fn changed_files(&self, base_ref: &str, head_ref: &str) -> anyhow::Result<Vec<String>>;
}

/// [`VcsInspector`] backed by the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitInspector {
    repo: PathBuf,
}

impl GitInspector {
    pub fn new(repo: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
        }
    }
}

impl VcsInspector for GitInspector {
    /// Files changed on `head_ref` since it diverged from `base_ref`
    /// (`git diff --name-only base...head`).
    fn changed_files(&self, base_ref: &str, head_ref: &str) -> anyhow::Result<Vec<String>> {
        if base_ref.starts_with('-') || head_ref.starts_with('-') {
            anyhow::bail!("invalid ref: {base_ref:?}...{head_ref:?}");
        }
        let range = format!("{base_ref}...{head_ref}");
        let output = Tool::new("git")
            .args(&["diff", "--name-only", &range, "--"])
            .current_dir(&self.repo)
            .timeout(Duration::from_secs(30))
            .run_ok()?;
        Ok(parse_name_only(&output.stdout))
    }
}

fn parse_name_only(stdout: &str) -> Vec<String> {
    let mut files: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    files.dedup();
    files
}
