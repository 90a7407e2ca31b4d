//! OS process tree helpers used for signal routing.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

/// Snapshot of parent/child relations and command lines.
#[derive(Debug, Default)]
pub struct ProcessTree {
    children: HashMap<u32, Vec<u32>>,
    commands: HashMap<u32, (Option<PathBuf>, Option<PathBuf>)>,
}

impl ProcessTree {
    /// Take a snapshot of every process on the host.
    #[must_use]
    pub fn snapshot() -> Self {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut tree = Self::default();
        for (pid, process) in sys.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            let pid = pid.as_u32();
            if let Some(parent) = process.parent() {
                tree.children.entry(parent.as_u32()).or_default().push(pid);
            }
            let argv0 = process.cmd().first().map(PathBuf::from);
            let exe = process.exe().map(Path::to_path_buf);
            tree.commands.insert(pid, (argv0, exe));
        }
        for children in tree.children.values_mut() {
            children.sort_unstable();
        }
        tree
    }

    /// Direct children of `pid`.
    #[must_use]
    pub fn children(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map_or(&[], Vec::as_slice)
    }

    /// Every descendant of `pid`, breadth first.
    #[must_use]
    pub fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut queue = VecDeque::from([pid]);
        let mut found = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &child in self.children(current) {
                if child != pid && !found.contains(&child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        found
    }

    /// Whether `pid` runs `binary`, by argv\[0\] or executable path.
    #[must_use]
    pub fn runs_binary(&self, pid: u32, binary: &Path) -> bool {
        match self.commands.get(&pid) {
            Some((argv0, exe)) => {
                argv0.as_deref() == Some(binary) || exe.as_deref() == Some(binary)
            }
            None => false,
        }
    }

    /// Topmost processes in the tree rooted at `pid` running `binary`.
    #[must_use]
    pub fn binary_targets(&self, pid: u32, binary: &Path) -> Vec<u32> {
        let mut targets = Vec::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(current) = queue.pop_front() {
            if self.runs_binary(current, binary) {
                targets.push(current);
                continue;
            }
            for &child in self.children(current) {
                if child != pid {
                    queue.push_back(child);
                }
            }
        }
        targets
    }
}

/// Send `signal` to `pid`, ignoring delivery errors (the process may
/// already be gone).
pub fn signal_pid(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), signal) {
        debug!(pid, %signal, %err, "signal delivery failed");
    }
}

/// Signal every descendant of `pid`, highest pid first, then `pid` itself.
pub fn kill_tree(pid: u32, signal: Signal) {
    let tree = ProcessTree::snapshot();
    let mut descendants = tree.descendants(pid);
    descendants.sort_unstable_by(|a, b| b.cmp(a));
    for child in descendants {
        signal_pid(child, signal);
    }
    signal_pid(pid, signal);
}

/// Signal the processes running `binary` in the tree rooted at `pid`:
/// `pid` itself when it matches, otherwise the topmost matching
/// descendants. Returns how many processes were signalled; with `0` nothing
/// was sent and the caller decides on a fallback.
pub fn kill_binary(binary: &Path, pid: u32, signal: Signal) -> usize {
    let targets = ProcessTree::snapshot().binary_targets(pid, binary);
    for &target in &targets {
        signal_pid(target, signal);
    }
    targets.len()
}
