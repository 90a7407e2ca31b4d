//! Signal routing over real OS process trees.

use std::path::Path;
use std::process::{Child, Command, Stdio};

use nix::sys::signal::Signal;
use serial_test::serial;

use procfleet::config::GroupConfig;
use procfleet::process::tree::{kill_binary, kill_tree, ProcessTree};
use procfleet::protocol::params::LaunchParams;

use super::test_helpers::{alive, eventually, WORKER_BIN};

fn spawn_shell(script: &str, args: &[&str]) -> Child {
    Command::new("/bin/sh")
        .arg("-c")
        .arg(script)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn cleanup(mut shell: Child) {
    kill_tree(shell.id(), Signal::SIGKILL);
    shell.wait().unwrap();
}

#[test]
#[serial]
fn descendants_include_grandchildren_and_kill_tree_reaches_them() {
    let shell = spawn_shell("/bin/sh -c 'sleep 300; true' & wait", &[]);
    let root = shell.id();

    let mut found = Vec::new();
    assert!(
        eventually(|| {
            found = ProcessTree::snapshot().descendants(root);
            found.len() >= 2
        }),
        "nested shell and its sleep never showed up"
    );
    let tree = ProcessTree::snapshot();
    let inner = tree.children(root).to_vec();
    assert_eq!(inner.len(), 1);
    assert_eq!(tree.children(inner[0]).len(), 1, "grandchild under the inner shell");

    cleanup(shell);
    for pid in found {
        assert!(eventually(|| !alive(pid)), "descendant {pid} survived");
    }
}

#[test]
#[serial]
fn terminate_reaches_the_worker_binary_behind_a_shell() {
    let params = LaunchParams::new(
        1,
        1,
        1,
        GroupConfig::new("test", "child").with_param("sleep", 300),
    )
    .to_json()
    .unwrap();
    // The shell outlives the worker unless it is signalled itself.
    let shell = spawn_shell(r#""$0" child "$1"; sleep 300"#, &[WORKER_BIN, params.as_str()]);
    let root = shell.id();
    let binary = Path::new(WORKER_BIN);

    let mut targets = Vec::new();
    assert!(
        eventually(|| {
            targets = ProcessTree::snapshot().binary_targets(root, binary);
            targets.len() == 1
        }),
        "worker never started under the shell"
    );
    let worker = targets[0];
    assert_ne!(worker, root);

    assert_eq!(kill_binary(binary, root, Signal::SIGTERM), 1);
    assert!(eventually(|| !alive(worker)), "worker ignored SIGTERM");
    assert!(alive(root), "the shell was not the target");

    cleanup(shell);
}

#[test]
#[serial]
fn unmatched_binary_signals_nothing() {
    let shell = spawn_shell("sleep 300; true", &[]);
    let root = shell.id();
    assert!(eventually(|| !ProcessTree::snapshot().children(root).is_empty()));
    let sleeper = ProcessTree::snapshot().children(root)[0];

    assert_eq!(kill_binary(Path::new(WORKER_BIN), root, Signal::SIGTERM), 0);
    std::thread::sleep(std::time::Duration::from_millis(200));
    assert!(alive(root));
    assert!(alive(sleeper));

    cleanup(shell);
}
