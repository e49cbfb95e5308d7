//! Worker OS process supervision: spawn, stdio forwarding, exit detection,
//! idempotent kill. No other component talks to the OS process directly.

use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::WorkerId;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code a worker uses to ask for a restart (e.g. after an in-worker
/// dependency install). Treated as a restart request, not an error.
pub const INTENTIONAL_RESTART_EXIT_CODE: i32 = 200;

const STDERR_TAIL_LINES: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn is_restart_request(&self) -> bool {
        self.code == Some(INTENTIONAL_RESTART_EXIT_CODE)
    }
}

/// Configuration for starting one worker process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub worker_id: WorkerId,
    pub executable: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
}

/// Handle to a spawned worker process. Exit is observable through a watch
/// that fires exactly once, even when a kill races the natural exit.
pub struct WorkerProcessHandle {
    worker_id: WorkerId,
    pid: Option<u32>,
    kill_token: CancellationToken,
    exited: watch::Receiver<Option<ExitStatus>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl WorkerProcessHandle {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Idempotent; a kill after the process exited is
    /// a no-op.
    pub fn kill(&self) {
        self.kill_token.cancel();
    }

    pub fn exited(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// Wait for the process to exit and return its status.
    pub async fn wait(&self) -> ExitStatus {
        let mut exited = self.exited.clone();
        loop {
            if let Some(status) = exited.borrow().clone() {
                return status;
            }
            if exited.changed().await.is_err() {
                return exited.borrow().clone().unwrap_or_default();
            }
        }
    }

    /// The most recent stderr lines, kept to enrich abnormal-exit errors.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lock().unwrap().iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn for_testing(
        worker_id: WorkerId,
    ) -> (Self, watch::Sender<Option<ExitStatus>>, CancellationToken) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();
        let handle = Self {
            worker_id,
            pid: None,
            kill_token: kill_token.clone(),
            exited: exit_rx,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        };
        (handle, exit_tx, kill_token)
    }
}

/// Starts worker processes. A trait seam so tests can substitute a mock
/// driver; production uses [`OsProcessDriver`].
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    async fn start(&self, config: ProcessConfig) -> Result<WorkerProcessHandle>;
}

/// Spawns workers as plain child processes of the host.
pub struct OsProcessDriver;

impl OsProcessDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OsProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessDriver for OsProcessDriver {
    async fn start(&self, config: ProcessConfig) -> Result<WorkerProcessHandle> {
        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args)
            .envs(config.env.iter().cloned())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker process '{}'", config.executable))?;
        let pid = child.id();

        info!(
            worker_id = %config.worker_id,
            pid = ?pid,
            executable = %config.executable,
            "worker process started"
        );

        if let Some(stdout) = child.stdout.take() {
            let worker_id = config.worker_id.clone();
            tokio::spawn(async move {
                forward_stdout(stdout, worker_id).await;
            });
        }

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let worker_id = config.worker_id.clone();
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                forward_stderr(stderr, worker_id, tail).await;
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_token = CancellationToken::new();
        let watcher_token = kill_token.clone();
        let worker_id = config.worker_id.clone();
        tokio::spawn(async move {
            let natural = tokio::select! {
                res = child.wait() => Some(res),
                _ = watcher_token.cancelled() => None,
            };
            let status = match natural {
                Some(res) => res,
                None => {
                    if let Err(err) = child.start_kill() {
                        debug!(worker_id = %worker_id, error = %err, "kill requested for an already-exited process");
                    }
                    child.wait().await
                }
            };
            let exit_status = match status {
                Ok(status) => ExitStatus {
                    code: status.code(),
                },
                Err(err) => {
                    warn!(worker_id = %worker_id, error = %err, "failed to reap worker process");
                    ExitStatus::default()
                }
            };
            debug!(
                worker_id = %worker_id,
                exit_code = ?exit_status.code,
                "worker process exited"
            );
            let _ = exit_tx.send(Some(exit_status));
        });

        Ok(WorkerProcessHandle {
            worker_id: config.worker_id,
            pid,
            kill_token,
            exited: exit_rx,
            stderr_tail,
        })
    }
}

async fn forward_stdout(stdout: impl AsyncRead + Unpin, worker_id: WorkerId) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(worker_id = %worker_id, "{line}");
    }
}

async fn forward_stderr(
    stderr: impl AsyncRead + Unpin,
    worker_id: WorkerId,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(worker_id = %worker_id, "{line}");
        let mut tail = tail.lock().unwrap();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> ProcessConfig {
        ProcessConfig {
            worker_id: WorkerId::generate(),
            executable: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![],
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr_tail() {
        let driver = OsProcessDriver::new();
        let handle = driver
            .start(sh("echo out; echo one 1>&2; echo two 1>&2; exit 7"))
            .await
            .unwrap();

        let status = handle.wait().await;
        assert_eq!(status.code, Some(7));
        // stderr forwarding races process exit by a scheduler tick
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tail = handle.stderr_tail();
        assert!(tail.contains(&"one".to_string()));
        assert!(tail.contains(&"two".to_string()));
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let driver = OsProcessDriver::new();
        let handle = driver
            .start(sh("for i in 1 2 3 4 5; do echo line$i 1>&2; done"))
            .await
            .unwrap();
        handle.wait().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tail = handle.stderr_tail();
        assert_eq!(tail.len(), STDERR_TAIL_LINES);
        assert_eq!(tail.last().unwrap(), "line5");
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let driver = OsProcessDriver::new();
        let handle = driver.start(sh("sleep 30")).await.unwrap();

        handle.kill();
        let status = handle.wait().await;
        assert_eq!(status.code, None);

        // killing after exit must not panic or change the status
        handle.kill();
        assert!(handle.has_exited());
        assert_eq!(handle.wait().await.code, None);
    }

    #[tokio::test]
    async fn test_exit_observed_by_multiple_watchers() {
        let driver = OsProcessDriver::new();
        let handle = driver.start(sh("exit 0")).await.unwrap();

        let mut a = handle.exited();
        let b = handle.wait().await;
        assert!(b.is_success());

        if a.borrow().is_none() {
            a.changed().await.unwrap();
        }
        assert_eq!(a.borrow().clone().unwrap(), b);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let driver = OsProcessDriver::new();
        let config = ProcessConfig {
            worker_id: WorkerId::generate(),
            executable: "/nonexistent/worker-binary".to_string(),
            args: vec![],
            env: vec![],
            working_dir: None,
        };
        assert!(driver.start(config).await.is_err());
    }

    #[test]
    fn test_restart_exit_code_classification() {
        assert!(ExitStatus { code: Some(200) }.is_restart_request());
        assert!(!ExitStatus { code: Some(0) }.is_restart_request());
        assert!(ExitStatus { code: Some(0) }.is_success());
        assert!(!ExitStatus { code: None }.is_success());
    }
}
