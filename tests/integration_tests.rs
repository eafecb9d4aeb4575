//! Integration tests for conductor.
//!
//! Drives the built binary end to end against temporary project
//! directories, plus cross-instance lock contention over a shared marker
//! file.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a conductor Command
fn conductor() -> Command {
    cargo_bin_cmd!("conductor")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

/// Three instant phases and no agents, for unattended runs
fn write_zero_budget_plan(dir: &TempDir) {
    fs::write(
        dir.path().join("conductor.toml"),
        r#"
        [scheduler]
        main_interval_secs = 1
        task_interval_secs = 1

        [[phases]]
        name = "a"
        duration_secs = 0

        [[phases]]
        name = "b"
        duration_secs = 0

        [[phases]]
        name = "c"
        duration_secs = 0
        "#,
    )
    .unwrap();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        conductor().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        conductor().arg("--version").assert().success();
    }

    #[test]
    fn test_status_creates_state_directory() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"success\": true"));

        assert!(dir.path().join(".conductor/workflow.json").exists());
        assert!(dir.path().join(".conductor/backups").exists());
    }

    #[test]
    fn test_output_is_json() {
        let dir = create_temp_project();

        let output = conductor()
            .current_dir(dir.path())
            .arg("status")
            .output()
            .unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
        assert_eq!(parsed["success"], true);
        assert!(parsed["data"]["document"]["current_phase"].is_string());
    }
}

mod phases {
    use super::*;

    #[test]
    fn test_start_persists_phase() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["start", "discovery"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"phase\": \"discovery\""))
            .stdout(predicate::str::contains("\"next\": \"planning\""));

        let doc = fs::read_to_string(dir.path().join(".conductor/workflow.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["current_phase"], "discovery");
        assert_eq!(parsed["status"], "running");
    }

    #[test]
    fn test_start_unknown_phase_fails() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["start", "no-such-phase"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"success\": false"))
            .stdout(predicate::str::contains("Unknown phase"));
    }

    #[test]
    fn test_phase_complete_without_active_phase_fails() {
        let dir = create_temp_project();

        // Each CLI invocation is a fresh process; no phase is armed
        conductor()
            .current_dir(dir.path())
            .args(["phase", "complete"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("No phase is currently active"));
    }

    #[test]
    fn test_custom_plan_from_config() {
        let dir = create_temp_project();
        write_zero_budget_plan(&dir);

        conductor()
            .current_dir(dir.path())
            .args(["start", "a"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"next\": \"b\""));
    }
}

mod validation_and_backups {
    use super::*;

    #[test]
    fn test_validate_fresh_document() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"valid\": true"));
    }

    #[test]
    fn test_validate_rejects_missing_sections() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".conductor")).unwrap();
        fs::write(
            dir.path().join(".conductor/workflow.json"),
            r#"{"current_phase": "a"}"#,
        )
        .unwrap();

        conductor()
            .current_dir(dir.path())
            .arg("validate")
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"valid\": false"))
            .stdout(predicate::str::contains("missing required field"));
    }

    #[test]
    fn test_backup_create_then_list() {
        let dir = create_temp_project();
        conductor()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .args(["backup", "create"])
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .args(["backup", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("workflow-"));
    }

    #[test]
    fn test_backup_restore_unknown_name_fails() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["backup", "restore", "workflow-19990101-000000.json"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Unknown backup"));
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["start", "discovery"])
            .assert()
            .success();
        conductor()
            .current_dir(dir.path())
            .args(["backup", "create"])
            .assert()
            .success();

        let list = conductor()
            .current_dir(dir.path())
            .args(["backup", "list"])
            .output()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&list.stdout).unwrap();
        let name = parsed["data"]["backups"][0].as_str().unwrap().to_string();

        conductor()
            .current_dir(dir.path())
            .args(["start", "planning"])
            .assert()
            .success();

        conductor()
            .current_dir(dir.path())
            .args(["backup", "restore", &name])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"current_phase\": \"discovery\""));
    }
}

mod agents {
    use super::*;

    fn write_agent_config(dir: &TempDir, command: &str) {
        fs::write(
            dir.path().join("conductor.toml"),
            format!(
                r#"
                [[phases]]
                name = "only"
                agents = ["worker"]
                duration_secs = 600

                [[agents]]
                name = "worker"
                command = "{command}"
                timeout_secs = 10
                "#
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_agent_list_shows_configured_agents() {
        let dir = create_temp_project();
        write_agent_config(&dir, "true");

        conductor()
            .current_dir(dir.path())
            .args(["agent", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("worker"))
            .stdout(predicate::str::contains("healthy"));
    }

    #[test]
    fn test_agent_activate_runs_command() {
        let dir = create_temp_project();
        write_agent_config(&dir, "touch activated");

        conductor()
            .current_dir(dir.path())
            .args(["agent", "activate", "worker"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"succeeded\": true"));

        assert!(dir.path().join("activated").exists());
    }

    #[test]
    fn test_agent_activate_reports_command_failure() {
        let dir = create_temp_project();
        write_agent_config(&dir, "exit 7");

        conductor()
            .current_dir(dir.path())
            .args(["agent", "activate", "worker"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"succeeded\": false"));
    }

    #[test]
    fn test_agent_activate_unknown_fails() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["agent", "activate", "ghost"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Unknown agent"));
    }

    #[test]
    fn test_agent_health_reports_per_agent() {
        let dir = create_temp_project();
        write_agent_config(&dir, "true");

        conductor()
            .current_dir(dir.path())
            .args(["agent", "health", "worker"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"healthy\": true"));
    }
}

mod unattended {
    use super::*;

    #[test]
    fn test_auto_runs_all_phases_to_complete() {
        let dir = create_temp_project();
        write_zero_budget_plan(&dir);

        conductor()
            .current_dir(dir.path())
            .arg("auto")
            .timeout(std::time::Duration::from_secs(60))
            .assert()
            .success()
            .stdout(predicate::str::contains("\"workflow\": \"complete\""))
            .stdout(predicate::str::contains("\"final_phase\": \"c\""));

        let doc = fs::read_to_string(dir.path().join(".conductor/workflow.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["status"], "complete");
        assert_eq!(parsed["current_phase"], "c");
    }

    #[test]
    fn test_daemon_stop_writes_control_file() {
        let dir = create_temp_project();

        conductor()
            .current_dir(dir.path())
            .args(["daemon", "stop"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stop requested"));

        assert!(dir.path().join(".conductor/stop-requested").exists());
    }
}

mod lock_contention {
    use super::*;
    use conductor::config::LockSettings;
    use conductor::lock::LockCoordinator;

    fn settings(max_attempts: u32) -> LockSettings {
        LockSettings {
            stale_secs: 300,
            max_attempts,
            retry_delay_ms: 50,
        }
    }

    /// Two coordinator instances over the same marker file model two
    /// orchestrator processes racing on one document.
    #[tokio::test]
    async fn test_second_instance_waits_for_release() {
        let dir = create_temp_project();
        let path = dir.path().join(".conductor/workflow.lock");

        let first = LockCoordinator::new(path.clone(), settings(2));
        let second = LockCoordinator::new(path.clone(), settings(100));

        let guard = first.acquire().await.unwrap();

        // While held, a bounded contender exhausts its attempts
        let impatient = LockCoordinator::new(path, settings(2));
        assert!(impatient.acquire().await.is_err());

        let contender = tokio::spawn(async move { second.acquire().await });
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        guard.release().unwrap();

        let second_guard = contender.await.unwrap().unwrap();
        second_guard.release().unwrap();
    }
}
