/// Agent host lifecycle event handled by `modegate hook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HookEvent {
    #[value(alias = "SessionStart")]
    SessionStart,
    #[value(alias = "PreToolUse")]
    PreToolUse,
    #[value(alias = "PostToolUse")]
    PostToolUse,
    #[value(alias = "Stop")]
    Stop,
}

impl HookEvent {
    pub const ALL: [HookEvent; 4] = [
        HookEvent::SessionStart,
        HookEvent::PreToolUse,
        HookEvent::PostToolUse,
        HookEvent::Stop,
    ];

    /// Event name as it appears in settings.json and hook payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::Stop => "Stop",
        }
    }

    /// Argument passed to `modegate hook`.
    pub fn cli_name(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "session-start",
            HookEvent::PreToolUse => "pre-tool-use",
            HookEvent::PostToolUse => "post-tool-use",
            HookEvent::Stop => "stop",
        }
    }
}

/// Hook registry entry
#[derive(Debug, Clone)]
pub struct HookEntry {
    pub event: HookEvent,
    /// Tool-name matcher; empty matches every tool.
    pub matcher: &'static str,
}

impl HookEntry {
    /// Command line written into settings.json.
    pub fn command(&self) -> String {
        format!("modegate hook {}", self.event.cli_name())
    }
}

/// Every handler modegate installs.
pub struct HookRegistry;

impl HookRegistry {
    pub fn all() -> Vec<HookEntry> {
        HookEvent::ALL
            .into_iter()
            .map(|event| HookEntry { event, matcher: "" })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn all_events_registered() {
        let hooks = HookRegistry::all();
        assert_eq!(hooks.len(), 4);
        assert!(hooks.iter().any(|h| h.event == HookEvent::Stop));
        assert!(hooks.iter().all(|h| h.matcher.is_empty()));
    }

    #[test]
    fn commands_use_cli_names() {
        let entry = HookEntry {
            event: HookEvent::PostToolUse,
            matcher: "",
        };
        assert_eq!(entry.command(), "modegate hook post-tool-use");
    }

    #[test]
    fn host_event_names_parse() {
        assert_eq!(
            HookEvent::from_str("SessionStart", false).unwrap(),
            HookEvent::SessionStart
        );
        assert_eq!(HookEvent::from_str("stop", false).unwrap(), HookEvent::Stop);
        for event in HookEvent::ALL {
            assert_eq!(HookEvent::from_str(event.cli_name(), false).unwrap(), event);
        }
    }
}
