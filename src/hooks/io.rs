//! Hook payloads: what the host sends on stdin and what we print back.

use serde::Deserialize;
use serde_json::{Value, json};

use super::HookEvent;
use crate::modes::ControlSignal;

/// Fields modegate reads from a hook payload. Everything is optional; an
/// empty stdin decodes to the default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
    #[serde(default)]
    pub stop_hook_active: bool,
}

impl HookInput {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    /// Shell command line of a Bash tool call.
    pub fn command(&self) -> Option<&str> {
        self.tool_input
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
    }

    /// Error text when the tool response reports a failure.
    ///
    /// A response fails when `is_error` is true, `success` is false, an exit
    /// code is non-zero, `error` is a non-empty string, or `interrupted` is
    /// true.
    pub fn failure(&self) -> Option<String> {
        let r = &self.tool_response;
        if !r.is_object() {
            return None;
        }
        let flag = |key: &str| r.get(key).and_then(Value::as_bool);
        let error_text = r
            .get("error")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|e| !e.is_empty());
        let exit_code = r
            .get("exit_code")
            .or_else(|| r.get("exitCode"))
            .and_then(Value::as_i64)
            .filter(|c| *c != 0);

        let failed = flag("is_error") == Some(true)
            || flag("success") == Some(false)
            || flag("interrupted") == Some(true)
            || exit_code.is_some()
            || error_text.is_some();
        if !failed {
            return None;
        }

        let stderr = r
            .get("stderr")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());
        Some(match (error_text, stderr, exit_code) {
            (Some(e), _, _) => e.to_string(),
            (None, Some(s), _) => s.to_string(),
            (None, None, Some(code)) => format!("exited with code {code}"),
            _ if flag("interrupted") == Some(true) => "interrupted".to_string(),
            _ => "tool reported a failure".to_string(),
        })
    }
}

/// One decision printed to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutput {
    /// Let the host carry on, optionally telling the user something.
    Proceed { system_message: Option<String> },
    /// Prevent the agent from stopping; `reason` becomes its next instruction.
    Block { reason: String },
    /// End the session.
    Halt { stop_reason: String },
    /// Extra context for the agent's next turn.
    Context { event: HookEvent, context: String },
    /// Pre-approve a tool call.
    Allow { reason: String },
}

impl HookOutput {
    pub fn neutral() -> Self {
        HookOutput::Proceed {
            system_message: None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            HookOutput::Proceed { system_message: None } => json!({ "continue": true }),
            HookOutput::Proceed {
                system_message: Some(msg),
            } => json!({ "continue": true, "systemMessage": msg }),
            HookOutput::Block { reason } => json!({ "decision": "block", "reason": reason }),
            HookOutput::Halt { stop_reason } => {
                json!({ "continue": false, "stopReason": stop_reason })
            }
            HookOutput::Context { event, context } => json!({
                "hookSpecificOutput": {
                    "hookEventName": event.as_str(),
                    "additionalContext": context,
                }
            }),
            HookOutput::Allow { reason } => json!({
                "hookSpecificOutput": {
                    "hookEventName": HookEvent::PreToolUse.as_str(),
                    "permissionDecision": "allow",
                    "permissionDecisionReason": reason,
                }
            }),
        }
    }
}

impl From<ControlSignal> for HookOutput {
    fn from(signal: ControlSignal) -> Self {
        match signal {
            ControlSignal::Continue(reason) => HookOutput::Block { reason },
            ControlSignal::AllowStop(system_message) => HookOutput::Proceed { system_message },
            ControlSignal::Abort(stop_reason) => HookOutput::Halt { stop_reason },
        }
    }
}
