//! Launcher scenarios supervising real local workers.
//!
//! Timing-sensitive scenarios run serially so they do not compete for CPU.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serial_test::serial;

use procfleet::config::{GroupConfig, LauncherSettings, ProcessConfig};
use procfleet::launcher::{Launcher, LauncherControl};
use procfleet::observer::{LauncherEvents, ProcessInfo, SharedEvents};
use procfleet::registry::HandlerRegistry;
use procfleet::AppError;

use super::test_helpers::{child_group, eventually, marked_pids, master, worker_group};

fn settings() -> LauncherSettings {
    LauncherSettings::default()
}

// ── Plain runs ───────────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn single_line_worker_relays_its_record() {
    let (mut launcher, sink) = master(settings());
    launcher
        .set_groups(vec![
            worker_group("test", "single-line").with_process(ProcessConfig::local(1))
        ])
        .unwrap();

    launcher.run_master(false).await.unwrap();

    assert_eq!(
        sink.sorted(),
        vec![
            "emergency - [test] [localhost] [single-line/1/1] ONE_LINE",
            "notice - [test] [localhost] [single-line/1/1] Ended",
        ]
    );
}

#[tokio::test]
#[serial]
async fn one_instance_runs_to_completion() {
    let (mut launcher, sink) = master(settings());
    launcher.set_groups(vec![child_group("test", 1)]).unwrap();

    launcher.run_master(false).await.unwrap();

    assert_eq!(
        sink.sorted(),
        vec![
            "info - [test] [localhost] [child/1/1] Child 1 1",
            "info - [test] [localhost] [child/1/1] Child clean exit",
            "notice - [test] [localhost] [child/1/1] Ended",
        ]
    );
}

#[tokio::test]
#[serial]
async fn instances_get_consecutive_ids() {
    let (mut launcher, sink) = master(settings());
    launcher.set_groups(vec![child_group("test", 3)]).unwrap();

    launcher.run_master(false).await.unwrap();

    for id in 1..=3 {
        assert!(sink.contains(&format!(
            "info - [test] [localhost] [child/{id}/{id}] Child {id} {id}"
        )));
        assert_eq!(
            sink.count(&format!("notice - [test] [localhost] [child/{id}/{id}] Ended")),
            1
        );
    }
}

#[tokio::test]
#[serial]
async fn groups_share_the_run_id_sequence() {
    let (mut launcher, sink) = master(settings());
    launcher
        .set_groups(vec![child_group("test", 1), child_group("test2", 1)])
        .unwrap();

    launcher.run_master(false).await.unwrap();

    assert_eq!(
        sink.sorted(),
        vec![
            "info - [test2] [localhost] [child/2/1] Child 2 1",
            "info - [test2] [localhost] [child/2/1] Child clean exit",
            "info - [test] [localhost] [child/1/1] Child 1 1",
            "info - [test] [localhost] [child/1/1] Child clean exit",
            "notice - [test2] [localhost] [child/2/1] Ended",
            "notice - [test] [localhost] [child/1/1] Ended",
        ]
    );
}

#[tokio::test]
async fn run_without_groups_is_a_config_error() {
    let (mut launcher, _sink) = master(settings());
    let err = launcher.run_master(false).await.expect_err("nothing to run");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn unhandled_process_kind_is_rejected_up_front() {
    let (launcher, _sink) = master(settings());
    let mut launcher = launcher.with_registry(HandlerRegistry::empty());
    let err = launcher
        .set_groups(vec![child_group("test", 1)])
        .expect_err("no factory");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn invalid_group_is_rejected_up_front() {
    let (mut launcher, _sink) = master(settings());
    assert!(launcher
        .set_groups(vec![GroupConfig::new("test", "")])
        .is_err());
}

// ── Limits ───────────────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn max_running_time_stops_gracefully() {
    let (mut launcher, sink) = master(settings().with_max_running_time(2));
    launcher
        .set_groups(vec![child_group("test", 1).with_param("sleep", 20)])
        .unwrap();

    let started = Instant::now();
    launcher.run_master(false).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(sink.contains("notice - [master] Stopping..."));
    assert!(sink.contains("info - [test] [localhost] [child/1/1] Child clean exit"));
    assert_eq!(sink.count("notice - [test] [localhost] [child/1/1] Ended"), 1);
}

#[tokio::test]
#[serial]
async fn silent_fleet_hits_the_content_timeout() {
    let (mut launcher, sink) = master(settings().with_max_running_time(60).with_timeout(5));
    launcher
        .set_groups(vec![child_group("test", 1).with_param("forceSleep", 90)])
        .unwrap();

    let started = Instant::now();
    launcher.run_master(false).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(sink.contains("error - [master] Timeout waiting for content, force kill"));
    assert!(!sink.contains("info - [test] [localhost] [child/1/1] Child clean exit"));
    assert_eq!(sink.count("notice - [test] [localhost] [child/1/1] Ended"), 1);
}

#[tokio::test]
#[serial]
async fn stubborn_worker_hits_the_clean_shutdown_timeout() {
    let (mut launcher, sink) = master(settings().with_max_running_time(2).with_timeout(5));
    launcher
        .set_groups(vec![child_group("test", 1).with_param("neverDie", true)])
        .unwrap();

    let started = Instant::now();
    launcher.run_master(false).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(sink.contains("notice - [master] Stopping..."));
    assert!(sink.contains("error - [master] Timeout waiting for clean shutdown, force kill"));
    assert_eq!(sink.count("notice - [test] [localhost] [child/1/1] Ended"), 1);
}

#[tokio::test]
#[serial]
async fn read_timeouts_restart_until_the_cap() {
    let (mut launcher, sink) = master(settings());
    launcher
        .set_groups(vec![child_group("test", 1)
            .with_param("neverDie", true)
            .with_param("message", "")
            .with_timeout(2)])
        .unwrap();

    launcher.run_master(false).await.unwrap();

    assert_eq!(
        sink.count("error - [test] [localhost] [child/1/1] Timeout reached while waiting for data..."),
        3
    );
    assert_eq!(sink.count("notice - [test] [localhost] [child/1/1] Ended"), 3);
}

#[tokio::test]
#[serial]
async fn read_timeout_while_stopping_leaves_no_worker_alive() {
    let marker = format!("stubborn-{}", std::process::id());
    let (mut launcher, sink) = master(settings().with_max_running_time(2).with_timeout(60));
    launcher
        .set_groups(vec![child_group("test", 1)
            .with_param("neverDie", true)
            .with_param("marker", marker.as_str())
            .with_timeout(4)])
        .unwrap();
    assert!(eventually(|| marked_pids(&marker).is_empty()));

    launcher.run_master(false).await.unwrap();

    assert!(sink.contains("notice - [master] Stopping..."));
    assert!(sink.contains(
        "error - [test] [localhost] [child/1/1] Timeout reached while waiting for data..."
    ));
    assert_eq!(sink.count("notice - [test] [localhost] [child/1/1] Ended"), 1);
    assert!(
        eventually(|| marked_pids(&marker).is_empty()),
        "worker survived the run: {:?}",
        marked_pids(&marker)
    );
}

// ── Control ──────────────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn stop_request_soft_stops_every_worker() {
    let (mut launcher, sink) = master(settings());
    launcher
        .set_groups(vec![child_group("test", 2).with_param("sleep", 30)])
        .unwrap();

    let control = launcher.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        control.stop();
    });

    let started = Instant::now();
    launcher.run_master(true).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(sink.contains("notice - [master] Stopping..."));
    assert_eq!(
        sink.count("info - [test] [localhost] [child/1/1] Child clean exit"),
        1
    );
    assert_eq!(
        sink.count("info - [test] [localhost] [child/2/2] Child clean exit"),
        1
    );
}

#[tokio::test]
#[serial]
async fn suspended_group_is_not_started() {
    let (mut launcher, sink) = master(settings());
    launcher
        .set_groups(vec![child_group("test", 1), child_group("test2", 1)])
        .unwrap();
    launcher.control().suspend_group("test2", false);

    launcher.run_master(false).await.unwrap();

    assert!(launcher.is_group_suspended("test2"));
    assert!(sink.contains("notice - [test] [localhost] [child/1/1] Ended"));
    assert!(sink.lines().iter().all(|line| !line.contains("[test2]")));
}

/// Observer resuming `test2` on the first supervision tick.
#[derive(Debug, Default)]
struct ResumeOnCheck {
    checks: u32,
    events: Vec<String>,
}

impl LauncherEvents for ResumeOnCheck {
    fn starting(&mut self, _control: &LauncherControl) {
        self.events.push("starting".into());
    }

    fn started(&mut self, _control: &LauncherControl) {
        self.events.push("started".into());
    }

    fn check(&mut self, control: &LauncherControl) {
        self.checks += 1;
        if self.checks == 1 {
            control.resume_group("test2");
        }
    }

    fn stopped(&mut self, _control: &LauncherControl) {
        self.events.push("stopped".into());
    }

    fn process_started(&mut self, process: &ProcessInfo) {
        self.events.push(format!("process started {}", process.id));
    }
}

#[tokio::test]
#[serial]
async fn observer_can_resume_a_group_mid_run() {
    let observer = Arc::new(Mutex::new(ResumeOnCheck::default()));
    let events: SharedEvents = observer.clone();
    let (launcher, sink) = master(settings());
    let mut launcher = launcher.with_events(events);
    launcher
        .set_groups(vec![
            child_group("test", 1).with_param("sleep", 2),
            child_group("test2", 1),
        ])
        .unwrap();
    launcher.control().suspend_group("test2", false);

    launcher.run_master(false).await.unwrap();

    assert!(!launcher.is_group_suspended("test2"));
    assert!(sink.contains("info - [test2] [localhost] [child/2/1] Child 2 1"));
    assert_eq!(
        observer.lock().unwrap().events,
        vec![
            "starting",
            "process started 1",
            "started",
            "process started 2",
            "stopped"
        ]
    );
}

#[tokio::test]
#[serial]
async fn all_suspended_launcher_waits_until_stopped() {
    let (mut launcher, sink) = master(settings());
    launcher.set_groups(vec![child_group("test", 1)]).unwrap();

    // First run applies the suspension; nothing is started.
    launcher.control().suspend_all(false);
    launcher.run_master(false).await.unwrap();
    assert!(launcher.is_group_suspended("test"));

    // Second run waits while suspended, until the stop request.
    let control = launcher.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        control.stop();
    });
    let started = Instant::now();
    launcher.run_master(false).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(sink.lines().is_empty());
}

#[tokio::test]
#[serial]
async fn force_suspend_kills_the_group() {
    let (mut launcher, sink) = master(settings());
    launcher
        .set_groups(vec![child_group("test", 1).with_param("neverDie", true)])
        .unwrap();

    let control = launcher.control();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        control.suspend_group("test", true);
    });

    let started = Instant::now();
    launcher.run_master(false).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(sink.count("notice - [test] [localhost] [child/1/1] Ended"), 1);
    assert!(!sink.contains("notice - [master] Stopping..."));
}

#[tokio::test]
async fn relay_launcher_ignores_suspension() {
    let mut launcher = Launcher::relay();
    launcher.control().suspend_all(true);
    assert!(!launcher.is_master());
    launcher.set_groups(vec![child_group("test", 1)]).unwrap();
    assert!(!launcher.is_group_suspended("test"));
}
