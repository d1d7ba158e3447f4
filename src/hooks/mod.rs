//! Lifecycle hook handlers.
//!
//! Every handler maps one host event onto the rails and the mode machines.
//! Nothing here may fail the host: errors are logged and answered with the
//! neutral decision.

mod io;
mod registry;
mod run;

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::error;

pub use io::{HookInput, HookOutput};
pub use registry::{HookEntry, HookEvent, HookRegistry};
pub use run::{run_post_tool_use, run_pre_tool_use, run_session_start, run_stop};

use crate::config::Config;
use crate::heuristics::CommandClassifier;
use crate::state::StateStore;
use crate::subprocess::CommandRunner;
use crate::vcs::VcsInspector;

/// Everything a handler touches, passed in so tests can substitute fakes.
pub struct HookContext<'a> {
    pub store: &'a dyn StateStore,
    pub config: &'a Config,
    pub classifier: &'a CommandClassifier,
    pub runner: &'a dyn CommandRunner,
    pub vcs: &'a dyn VcsInspector,
    pub project_root: &'a Path,
    pub now: DateTime<Utc>,
}

/// Decode the payload, run the handler for `event` and return its decision.
pub fn handle(event: HookEvent, raw: &str, ctx: &HookContext<'_>) -> HookOutput {
    let _span = tracing::info_span!("hook", event = event.as_str()).entered();
    let input = match HookInput::parse(raw) {
        Ok(input) => input,
        Err(e) => {
            error!(error = %e, "malformed hook payload");
            return HookOutput::neutral();
        }
    };
    let result = match event {
        HookEvent::SessionStart => run_session_start(ctx, &input),
        HookEvent::PreToolUse => run_pre_tool_use(ctx, &input),
        HookEvent::PostToolUse => run_post_tool_use(ctx, &input),
        HookEvent::Stop => run_stop(ctx, &input),
    };
    result.unwrap_or_else(|e| {
        error!(error = %format!("{e:#}"), "hook handler failed");
        HookOutput::neutral()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Document, MemoryStore, Revision, StoreError, StoreResult};
    use crate::subprocess::ShellRunner;
    use crate::vcs::GitInspector;

    /// A store whose every read fails.
    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn load(&self, key: &str) -> StoreResult<Option<Document>> {
            Err(StoreError::LockTimeout(key.to_string()))
        }

        fn save(&self, key: &str, _body: &serde_json::Value) -> StoreResult<Revision> {
            Err(StoreError::LockTimeout(key.to_string()))
        }

        fn save_if(
            &self,
            key: &str,
            body: &serde_json::Value,
            _expected: Option<&Revision>,
        ) -> StoreResult<Option<Revision>> {
            self.save(key, body).map(Some)
        }
    }

    fn with_store<R>(store: &dyn StateStore, f: impl FnOnce(&HookContext<'_>) -> R) -> R {
        let config = Config::default();
        let classifier = CommandClassifier::default();
        let vcs = GitInspector::new(Path::new("."));
        let ctx = HookContext {
            store,
            config: &config,
            classifier: &classifier,
            runner: &ShellRunner,
            vcs: &vcs,
            project_root: Path::new("."),
            now: "2025-03-01T12:00:00Z".parse().unwrap(),
        };
        f(&ctx)
    }

    #[test]
    fn malformed_payload_is_neutral() {
        let store = MemoryStore::new();
        let out = with_store(&store, |ctx| handle(HookEvent::PostToolUse, "{oops", ctx));
        assert_eq!(out, HookOutput::neutral());
    }

    #[test]
    fn store_errors_are_neutral() {
        for event in HookEvent::ALL {
            let out = with_store(&BrokenStore, |ctx| {
                handle(event, r#"{"tool_name":"Edit","tool_response":{}}"#, ctx)
            });
            assert_eq!(out, HookOutput::neutral(), "{}", event.as_str());
        }
    }
}
