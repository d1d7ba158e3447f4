use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn modegate(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("modegate").unwrap();
    cmd.env_remove("MODEGATE_STATE_DIR")
        .env_remove("MODEGATE_LOG")
        .env_remove("RUST_LOG")
        .arg("--project-root")
        .arg(root);
    cmd
}

fn hook(root: &Path, event: &str, payload: &str) -> serde_json::Value {
    let out = modegate(root)
        .arg("hook")
        .arg(event)
        .write_stdin(payload)
        .output()
        .unwrap();
    assert!(out.status.success(), "hook {event} failed: {out:?}");
    serde_json::from_slice(&out.stdout).unwrap()
}

#[test]
fn stop_without_modes_lets_the_agent_stop() {
    let dir = TempDir::new().unwrap();
    let out = hook(dir.path(), "stop", r#"{"session_id":"s1","hook_event_name":"Stop"}"#);
    assert_eq!(out, serde_json::json!({ "continue": true }));
}

#[test]
fn malformed_payload_is_neutral() {
    let dir = TempDir::new().unwrap();
    let out = hook(dir.path(), "post-tool-use", "{not json");
    assert_eq!(out, serde_json::json!({ "continue": true }));
}

#[test]
fn host_event_names_are_accepted() {
    let dir = TempDir::new().unwrap();
    let out = hook(dir.path(), "PreToolUse", r#"{"tool_name":"Edit","tool_input":{}}"#);
    assert_eq!(out, serde_json::json!({ "continue": true }));
}

#[test]
fn ralph_blocks_stop_until_complete() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["ralph", "start", "make the build green", "--max-iterations", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("make the build green"));

    let out = hook(dir.path(), "stop", "{}");
    assert_eq!(out["decision"], "block");
    assert!(out["reason"].as_str().unwrap().contains("make the build green"));

    modegate(dir.path())
        .args(["ralph", "complete"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ralph succeeded"));

    let out = hook(dir.path(), "stop", "{}");
    assert_eq!(out["continue"], true);
    assert!(out.get("decision").is_none());
}

#[test]
fn conflicting_mode_is_rejected() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["ralph", "start", "task"])
        .assert()
        .success();
    modegate(dir.path())
        .args(["pipeline", "start", "another goal"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains(
            "mode 'pipeline' conflicts with active mode 'ralph'",
        ));
}

#[test]
fn companions_run_next_to_an_exclusive_mode() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["ralph", "start", "task"])
        .assert()
        .success();
    modegate(dir.path())
        .args(["swarm", "start", "--task", "a", "--task", "b", "--concurrency", "1"])
        .assert()
        .success();
    let out = modegate(dir.path())
        .args(["status", "--format", "json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let status: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let active: Vec<&str> = status["active"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["mode"].as_str().unwrap())
        .collect();
    assert!(active.contains(&"ralph"));
    assert!(active.contains(&"swarm"));
}

#[test]
fn cancel_sets_a_cooldown() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["autopilot", "start", "--task", "one", "--task", "two"])
        .assert()
        .success();
    modegate(dir.path())
        .args(["cancel", "autopilot"])
        .assert()
        .success()
        .stdout(predicate::str::contains("autopilot cancelled"));
    modegate(dir.path())
        .args(["autopilot", "start", "--task", "again"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains(
            "mode 'autopilot' was recently cancelled",
        ));
}

#[test]
fn document_modes_cannot_be_activated_bare() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["mode", "activate", "ralph"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("modegate ralph start"));
    modegate(dir.path())
        .args(["mode", "activate", "qa", "--goal", "check login"])
        .assert()
        .success();
    modegate(dir.path())
        .args(["mode", "deactivate", "qa"])
        .assert()
        .success()
        .stdout(predicate::str::contains("qa deactivated (success)"));
    modegate(dir.path())
        .args(["mode", "history", "--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("check login"));
}

#[test]
fn repeated_failures_escalate() {
    let dir = TempDir::new().unwrap();
    let payload = r#"{"tool_name":"Bash","tool_input":{"command":"make"},"tool_response":{"exit_code":2,"stderr":"boom"}}"#;
    assert_eq!(
        hook(dir.path(), "post-tool-use", payload),
        serde_json::json!({ "continue": true })
    );
    hook(dir.path(), "post-tool-use", payload);
    let third = hook(dir.path(), "post-tool-use", payload);
    let context = third["hookSpecificOutput"]["additionalContext"]
        .as_str()
        .unwrap();
    assert!(context.contains("Bash"));
    assert_eq!(third["hookSpecificOutput"]["hookEventName"], "PostToolUse");

    let out = modegate(dir.path())
        .args(["rails", "--format", "json"])
        .output()
        .unwrap();
    let rails: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(rails["failures"][0]["count"], 3);
}

#[test]
fn team_rejects_unknown_worker() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["team", "start", "auth", "split the auth module", "--workers", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("git worktree add"));
    modegate(dir.path())
        .args(["team", "update", "worker-9", "--status", "done"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("unknown worker 'worker-9'"));
    modegate(dir.path())
        .args(["team", "update", "worker-1", "--status", "working"])
        .assert()
        .success()
        .stdout(predicate::str::contains("team auth"));
}

#[test]
fn hooks_install_keeps_foreign_entries() {
    let dir = TempDir::new().unwrap();
    let settings_dir = dir.path().join(".claude");
    fs::create_dir_all(&settings_dir).unwrap();
    fs::write(
        settings_dir.join("settings.json"),
        r#"{"model":"x","hooks":{"Stop":[{"matcher":"","hooks":[{"type":"command","command":"other-tool"}]}]}}"#,
    )
    .unwrap();

    modegate(dir.path()).args(["hooks", "install"]).assert().success();
    modegate(dir.path()).args(["hooks", "install"]).assert().success();

    let settings: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(settings_dir.join("settings.json")).unwrap())
            .unwrap();
    assert_eq!(settings["model"], "x");
    let stop = settings["hooks"]["Stop"].as_array().unwrap();
    assert_eq!(stop.len(), 2);
    assert!(settings["hooks"]["SessionStart"].is_array());

    modegate(dir.path())
        .args(["hooks", "audit", "--format", "text"])
        .assert()
        .success();
}

#[test]
fn schema_describes_the_config() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"Config\""));
}

#[test]
fn bad_config_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join(".modegate.toml"), "[ralph]\nmax_iterations = \"lots\"\n").unwrap();
    modegate(dir.path())
        .args(["status", "--format", "json"])
        .assert()
        .failure();
}

#[test]
fn pipeline_cannot_advance_past_verify() {
    let dir = TempDir::new().unwrap();
    modegate(dir.path())
        .args(["pipeline", "start", "add login"])
        .assert()
        .success();
    modegate(dir.path())
        .args(["pipeline", "plan", "1. form\n2. session"])
        .assert()
        .success();
    modegate(dir.path())
        .args(["pipeline", "advance"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pipeline moved to verify"));
    modegate(dir.path())
        .args(["pipeline", "advance"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("modegate pipeline verify"));
}
