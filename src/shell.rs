//! Shell-safe primitives for guidance rendering.
//!
//! Guidance lines are commands the agent is expected to paste into a shell,
//! so every user-supplied value goes through [`shell_escape`] or is
//! validated first.

use std::borrow::Cow;

/// Escape a string for safe inclusion in a single-quoted shell argument.
///
/// Wraps in single quotes; an embedded single quote ends the quoting, inserts
/// an escaped quote and restarts: `'` → `'\''`.
pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Pass plain identifiers through unquoted, escape anything else.
pub fn safe_ident(value: &str) -> Cow<'_, str> {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'))
    {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(shell_escape(value))
    }
}

/// Validation error for values that end up in branch names and paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty(&'static str),
    TooLong {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    InvalidFormat {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Empty(field) => write!(f, "{field} cannot be empty"),
            ValidationError::TooLong { field, max, actual } => {
                write!(f, "{field} too long ({actual} chars, max {max})")
            }
            ValidationError::InvalidFormat {
                field,
                value,
                expected,
            } => {
                write!(f, "invalid {field} '{value}', expected {expected}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a team session name. It becomes a branch prefix and a directory
/// name, so keep it to `[a-z0-9][a-z0-9._-]*`.
pub fn validate_session_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::Empty("session name"));
    }
    if name.len() > 64 {
        return Err(ValidationError::TooLong {
            field: "session name",
            max: 64,
            actual: name.len(),
        });
    }
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        && !name.contains("..");
    if !valid {
        return Err(ValidationError::InvalidFormat {
            field: "session name",
            value: name.to_string(),
            expected: "[a-z0-9][a-z0-9._-]*, max 64 chars",
        });
    }
    Ok(())
}

// --- Command builders ---

/// Build: `git worktree add -b <branch> <path> <base>`
pub fn worktree_add_cmd(path: &str, branch: &str, base: &str) -> String {
    format!(
        "git worktree add -b {} {} {}",
        safe_ident(branch),
        safe_ident(path),
        safe_ident(base)
    )
}

/// Build: `git worktree remove <path>`
pub fn worktree_remove_cmd(path: &str) -> String {
    format!("git worktree remove {}", safe_ident(path))
}

/// Build: `git merge --no-ff <branch> -m '<message>'`
pub fn merge_cmd(branch: &str, message: &str) -> String {
    format!(
        "git merge --no-ff {} -m {}",
        safe_ident(branch),
        shell_escape(message)
    )
}

/// Build: `modegate team update <id> --status <status>`
pub fn team_update_cmd(worker: &str, status: &str) -> String {
    format!(
        "modegate team update {} --status {}",
        safe_ident(worker),
        safe_ident(status)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_simple() {
        assert_eq!(shell_escape("hello"), "'hello'");
    }

    #[test]
    fn escape_embedded_quote() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn escape_metacharacters_stay_literal() {
        assert_eq!(shell_escape("$(rm -rf /); `x`"), "'$(rm -rf /); `x`'");
    }

    #[test]
    fn safe_ident_passthrough_and_escape() {
        assert_eq!(safe_ident("auth/worker-1"), "auth/worker-1");
        assert_eq!(safe_ident("a b"), "'a b'");
        assert_eq!(safe_ident(""), "''");
    }

    #[test]
    fn session_names() {
        assert!(validate_session_name("auth-refactor").is_ok());
        assert!(validate_session_name("v2.1_fix").is_ok());
        assert_eq!(
            validate_session_name(""),
            Err(ValidationError::Empty("session name"))
        );
        assert!(validate_session_name("-x").is_err());
        assert!(validate_session_name("Has Caps").is_err());
        assert!(validate_session_name("a..b").is_err());
        assert!(validate_session_name("a;rm").is_err());
        assert!(matches!(
            validate_session_name(&"a".repeat(65)),
            Err(ValidationError::TooLong { actual: 65, .. })
        ));
    }

    #[test]
    fn builders_quote_user_values() {
        assert_eq!(
            worktree_add_cmd(".worktrees/s-worker-1", "s/worker-1", "main"),
            "git worktree add -b s/worker-1 .worktrees/s-worker-1 main"
        );
        assert_eq!(
            merge_cmd("s/worker-1", "merge worker-1: it's done"),
            "git merge --no-ff s/worker-1 -m 'merge worker-1: it'\\''s done'"
        );
        assert_eq!(worktree_remove_cmd("my dir"), "git worktree remove 'my dir'");
        assert_eq!(
            team_update_cmd("worker-2", "done"),
            "modegate team update worker-2 --status done"
        );
    }
}
