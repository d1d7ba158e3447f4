use std::process::ExitCode;

/// Errors that cause modegate to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("state error: {0}")]
    State(String),

    #[error("{message}")]
    WithCode { code: u8, message: String },

    #[error("audit failed")]
    AuditFailed,

    /// A mode refused the requested transition or activation.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn new(code: u8, message: String) -> Self {
        ExitError::WithCode { code, message }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::State(_) | ExitError::AuditFailed => ExitCode::from(6),
            ExitError::Rejected(_) => ExitCode::from(7),
            ExitError::WithCode { code, .. } => ExitCode::from(*code),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// A mode transition that does not apply to the current state.
///
/// Returned by the mode machines when a caller asks for something the state
/// cannot do (completing a task when none is in progress, assigning a task
/// that is not pending, ...). The document is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("{mode} is not active")]
    NotActive { mode: &'static str },

    #[error("{mode} has already finished ({status})")]
    Terminal { mode: &'static str, status: String },

    #[error("no task is in progress")]
    NoCurrentTask,

    #[error("unknown {kind} '{id}'")]
    UnknownId { kind: &'static str, id: String },

    #[error("{kind} '{id}' is {status}, expected {expected}")]
    WrongStatus {
        kind: &'static str,
        id: String,
        status: String,
        expected: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}
