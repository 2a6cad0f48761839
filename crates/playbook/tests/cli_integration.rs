//! CLI integration tests for the playbook command-line interface.
//!
//! Each test points `PLAYBOOK_CONFIG` at an empty file so user and
//! project config files on the machine do not leak in.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "").unwrap();
        Self { dir }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("playbook").unwrap();
        cmd.env("PLAYBOOK_CONFIG", self.dir.path().join("config.toml"))
            .env_remove("RUST_LOG")
            .current_dir(self.dir.path());
        cmd
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }
}

fn demo_bundle() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/loan_screening.toml")
}

// ─────────────────────────────────────────────────────────────────────────────
// Help
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    Env::new()
        .cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_run_requires_bundle() {
    Env::new()
        .cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<BUNDLE>"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Validate
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_validate_demo_bundle() {
    Env::new()
        .cmd()
        .arg("validate")
        .arg(demo_bundle())
        .assert()
        .success()
        .stdout(predicate::str::contains("ready to publish"));
}

#[test]
fn test_validate_reports_missing_contract() {
    let env = Env::new();
    let bundle = env.write(
        "bad.toml",
        r#"
[playbook]
code = "BAD"
name = "Bad"

[contracts.input]
type = "object"

[[steps]]
name = "only"
sequence = 1
worker_type = "ai"
"#,
    );
    env.cmd()
        .args(["--json", "validate"])
        .arg(bundle)
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"valid\": false"))
        .stdout(predicate::str::contains("missing output_contract"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_demo_bundle_completes() {
    Env::new()
        .cmd()
        .args(["--json", "run"])
        .arg(demo_bundle())
        .args(["--inputs", r#"{"applicant_id": "A-100", "amount": 42000}"#])
        .args(["--timeout-secs", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"completed\""))
        .stdout(predicate::str::contains("mock analysis"));
}

#[test]
fn test_run_rejects_invalid_inputs() {
    Env::new()
        .cmd()
        .arg("run")
        .arg(demo_bundle())
        .args(["--inputs", r#"{"applicant_id": "A-100", "amount": -1}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Playbook input validation failed"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_fills_defaults() {
    Env::new()
        .cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[orchestrator]"))
        .stdout(predicate::str::contains("max_concurrent_steps = 10"));
}
