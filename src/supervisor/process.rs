//! Stage subprocess management
//!
//! Spawns a pipeline stage as a child process, keeps a tail of its stderr,
//! and tracks liveness through an exit-watcher task.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SupervisionError;

/// Program and arguments for one stage
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A running stage process
pub struct StageProcess {
    stage: &'static str,
    pid: u32,
    alive: Arc<AtomicBool>,
    tail: Arc<Mutex<VecDeque<String>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl StageProcess {
    /// Spawn the stage and wait out the startup grace period. Fails if the
    /// process exits before the grace period ends.
    pub async fn spawn(
        stage: &'static str,
        command: &StageCommand,
        alive: Arc<AtomicBool>,
        grace: Duration,
        tail_lines: usize,
    ) -> Result<Self, SupervisionError> {
        info!("Spawning {}: {:?} {:?}", stage, command.program, command.args);

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisionError::Spawn { stage, source })?;

        let pid = child.id().unwrap_or(0);
        info!("{} started with PID {}", stage, pid);

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(tail_lines)));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_stderr(stage, stderr, tail.clone(), tail_lines.max(1)));
        }

        alive.store(true, Ordering::SeqCst);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel::<Option<String>>(None);
        let watcher = tokio::spawn(watch_exit(stage, child, kill_rx, alive.clone(), exit_tx));

        let process = Self {
            stage,
            pid,
            alive,
            tail,
            kill_tx: Some(kill_tx),
            watcher: Some(watcher),
        };

        let early = match tokio::time::timeout(grace, exit_rx.wait_for(|status| status.is_some())).await {
            Ok(Ok(status)) => status.clone(),
            _ => None,
        };
        if let Some(status) = early {
            // Let the stderr reader catch up with the final lines
            tokio::time::sleep(Duration::from_millis(50)).await;
            return Err(SupervisionError::EarlyExit {
                stage,
                status,
                stderr: process.stderr_tail(),
            });
        }

        Ok(process)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Last captured stderr lines, oldest first
    pub fn stderr_tail(&self) -> String {
        self.tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Kill the process and its whole descendant tree
    pub async fn terminate(mut self) -> Result<(), SupervisionError> {
        info!("Terminating {} (PID {})", self.stage, self.pid);

        if self.is_alive() {
            let killed = kill_descendants(self.pid);
            if killed > 0 {
                debug!("Killed {} descendants of {}", killed, self.stage);
            }
        }

        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            if tokio::time::timeout(Duration::from_secs(5), watcher).await.is_err() {
                return Err(SupervisionError::Terminate {
                    stage: self.stage,
                    pid: self.pid,
                });
            }
        }
        Ok(())
    }
}

impl Drop for StageProcess {
    fn drop(&mut self) {
        // The watcher owns the child; dropping it with kill_on_drop kills it
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn watch_exit(
    stage: &'static str,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
    exit_tx: watch::Sender<Option<String>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {}: {}", stage, e);
            }
            child.wait().await
        }
    };

    alive.store(false, Ordering::SeqCst);
    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unknown ({})", e),
    };
    info!("{} exited: {}", stage, status);
    let _ = exit_tx.send(Some(status));
}

async fn collect_stderr(
    stage: &'static str,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("[{}] {}", stage, line);
        let mut tail = tail.lock();
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Kill every descendant of `root`, deepest first. Returns how many were
/// signalled.
pub fn kill_descendants(root: u32) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    // Breadth-first walk; reversed, children come before their parents
    let mut order = Vec::new();
    let mut queue = VecDeque::from([Pid::from_u32(root)]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for kid in kids {
                order.push(*kid);
                queue.push_back(*kid);
            }
        }
    }

    let mut killed = 0;
    for pid in order.into_iter().rev() {
        if let Some(process) = sys.process(pid) {
            if process.kill() {
                killed += 1;
            }
        }
    }
    killed
}
