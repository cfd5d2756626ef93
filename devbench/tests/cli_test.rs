#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  create)
    echo "VM_IP=10.0.0.5"
    echo "status: running"
    ;;
  activate)
    echo "activation failed: disk full" 1>&2
    exit 2
    ;;
esac
exit 0
"#;

fn devbench(dir: &Path) -> Command {
    let script = dir.join("provision_vm.sh");
    if !script.exists() {
        std::fs::write(&script, SCRIPT).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut cmd = Command::cargo_bin("devbench").unwrap();
    cmd.env("PROVISION_SCRIPT_PATH", &script)
        .env("DEVBENCH_DB_PATH", dir.join("devbench.db"))
        .env("LOG_OUTPUT", "none")
        .current_dir(dir);
    cmd
}

fn created_id(output: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(output);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("ID:"))
        .map(|id| id.trim().to_string())
        .expect("create output should include the devbench ID")
}

#[test]
#[serial]
fn test_create_waits_for_script_and_prints_record() {
    let dir = tempfile::tempdir().unwrap();

    devbench(dir.path())
        .args(["create", "bench1", "--user", "alice", "--follow"])
        .assert()
        .success()
        .stdout(predicate::str::contains("VM_IP=10.0.0.5"))
        .stdout(predicate::str::contains("Status:   Ready"))
        .stdout(predicate::str::contains("IP:       10.0.0.5"));

    devbench(dir.path())
        .args(["list", "--user", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bench1"))
        .stdout(predicate::str::contains("Ready"));

    devbench(dir.path())
        .args(["list", "--user", "bob"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No devbenches found"));
}

#[test]
#[serial]
fn test_failed_activation_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();

    let output = devbench(dir.path())
        .args(["create", "bench1", "--user", "alice"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let id = created_id(&output.stdout);

    devbench(dir.path())
        .args(["activate", &id, "--user", "alice"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("exit code 2"))
        .stderr(predicate::str::contains("ended in status Failed"));

    devbench(dir.path())
        .args(["logs", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("activation failed: disk full"))
        .stdout(predicate::str::contains("Status: Failed"));

    devbench(dir.path())
        .args(["activate", &id, "--user", "mallory"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
#[serial]
fn test_status_json_and_delete() {
    let dir = tempfile::tempdir().unwrap();

    let output = devbench(dir.path())
        .args(["create", "bench1", "--user", "alice"])
        .output()
        .unwrap();
    let id = created_id(&output.stdout);

    devbench(dir.path())
        .args(["status", &id, "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ip_address\": \"10.0.0.5\""));

    devbench(dir.path())
        .args(["delete", &id])
        .assert()
        .success();

    devbench(dir.path())
        .args(["status", &id])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
