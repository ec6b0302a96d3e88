//! End-to-end checks against the `deployctl` binary itself, exercising the
//! config-loading and validation path that `plan`/`doctor` share. `deploy`,
//! `stop`, and `status` all require a live engine or a reachable SSH server
//! and are covered at the unit level instead (see `deployctl-core`).

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn deployctl() -> Command {
    Command::cargo_bin("deployctl").unwrap()
}

#[test]
fn plan_prints_resolved_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join(".deployctl.toml");
    fs::write(
        &config_path,
        r#"
[engine]
max_deploy = 2
max_release_timeout = "5m"

[[projects]]
id = 1
name = "web"
repo_kind = "git"
repo_url = "git@example.com:org/web.git"
target_root = "/srv/web/current"
target_releases = "/srv/web/releases"
enabled = true

[[servers]]
id = 1
name = "web-1"
user = "deploy"
host = "10.0.0.1"
"#,
    )
    .unwrap();

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("engine.max_deploy: 2"))
        .stdout(predicate::str::contains("[1] web"))
        .stdout(predicate::str::contains("10.0.0.1"));
}

#[test]
fn doctor_is_an_alias_of_plan() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join(".deployctl.toml");
    fs::write(&config_path, "").unwrap();

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("engine.max_deploy: 5"));
}

#[test]
fn missing_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("does-not-exist.toml");

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("projects:"));
}

#[test]
fn malformed_config_file_fails_with_context() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join(".deployctl.toml");
    fs::write(&config_path, "[engine\nmax_deploy = 1").unwrap();

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config file"));
}

#[test]
fn duplicate_project_ids_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join(".deployctl.toml");
    fs::write(
        &config_path,
        r#"
[[projects]]
id = 1
name = "web"
repo_kind = "git"
repo_url = "git@example.com:org/web.git"
target_root = "/srv/web/current"
target_releases = "/srv/web/releases"

[[projects]]
id = 1
name = "web-again"
repo_kind = "git"
repo_url = "git@example.com:org/web2.git"
target_root = "/srv/web2/current"
target_releases = "/srv/web2/releases"
"#,
    )
    .unwrap();

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("plan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate project id"));
}

#[test]
fn max_deploy_override_wins_over_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join(".deployctl.toml");
    fs::write(&config_path, "[engine]\nmax_deploy = 1\n").unwrap();

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("--max-deploy")
        .arg("7")
        .arg("plan")
        .assert()
        .success()
        // `plan` prints the raw config file value, not the CLI-merged one;
        // the override only takes effect once an engine is actually built.
        .stdout(predicate::str::contains("engine.max_deploy: 1"));
}

#[test]
fn status_on_unknown_task_reports_no_persisted_model() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join(".deployctl.toml");
    let store_dir = dir.path().join("records");
    fs::write(
        &config_path,
        format!(
            "record_store_dir = \"{}\"\n",
            store_dir.display().to_string().replace('\\', "\\\\")
        ),
    )
    .unwrap();

    deployctl()
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .arg("999")
        .assert()
        .success()
        .stdout(predicate::str::contains("has no persisted model yet"))
        .stdout(predicate::str::contains("no per-server outcomes recorded yet"));
}
