//! End-to-end tests of the `procfleet` master binary.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serial_test::serial;

use super::test_helpers::WORKER_BIN;

const MASTER_BIN: &str = env!("CARGO_BIN_EXE_procfleet");

fn fleet_file(dir: &std::path::Path, command: &str, params: &str) -> std::path::PathBuf {
    let path = dir.join("fleet.toml");
    let toml = format!(
        r#"
[launcher]
timeout_seconds = 30

[[groups]]
name = "test"
command = "{command}"
bin_path = "{WORKER_BIN}"

[groups.params]
{params}

[[groups.processes]]
kind = "local"
"#
    );
    std::fs::write(&path, toml).unwrap();
    path
}

#[test]
#[serial]
fn master_runs_a_fleet_file_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let config = fleet_file(dir.path(), "single-line", "");

    let output = Command::new(MASTER_BIN)
        .arg("--config")
        .arg(&config)
        .env("RUST_LOG", "info")
        .output()
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[test] [localhost] [single-line/1/1] ONE_LINE"));
    assert!(stdout.contains("[test] [localhost] [single-line/1/1] Ended"));
}

#[test]
#[serial]
fn json_log_format_emits_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let config = fleet_file(dir.path(), "child", "");

    let output = Command::new(MASTER_BIN)
        .arg("--config")
        .arg(&config)
        .arg("--log-format")
        .arg("json")
        .env("RUST_LOG", "info")
        .output()
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let ended = stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find(|record| {
            record["fields"]["message"]
                .as_str()
                .is_some_and(|message| message.ends_with("Ended"))
        })
        .expect("an Ended record");
    assert_eq!(ended["fields"]["severity"], "notice");
}

#[test]
fn invalid_fleet_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.toml");
    std::fs::write(&path, "groups = []").unwrap();

    let output = Command::new(MASTER_BIN)
        .arg("--config")
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
#[serial]
fn sigterm_stops_the_fleet_gracefully() {
    let dir = tempfile::tempdir().unwrap();
    let config = fleet_file(dir.path(), "child", "sleep = 60");

    let child = Command::new(MASTER_BIN)
        .arg("--config")
        .arg(&config)
        .arg("--never-exit")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_secs(2));
    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
    kill(pid, Signal::SIGTERM).unwrap();

    let started = Instant::now();
    let output = child.wait_with_output().unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[master] Received SIGTERM, stopping"));
    assert!(stdout.contains("[master] Stopping..."));
    assert!(stdout.contains("[test] [localhost] [child/1/1] Child clean exit"));
}
