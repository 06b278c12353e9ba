//! Remote Executor: a bounded worker pool that runs external commands
//! (SSH, rsync, batch-system submit/poll/kill, event handlers) with a
//! deadline and process-group cancellation.
//!
//! Grounded on the teacher's `tokio::process::Command` usage in
//! `loop/engine.rs` and the semaphore-bounded concurrency pattern in
//! `r#loop/manager.rs`'s `LoopManager` (`Arc<Semaphore>` gating
//! concurrent work).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn {0:?}: {1}")]
    Spawn(String, std::io::Error),
    #[error("command {0:?} timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("io error communicating with child: {0}")]
    Io(#[from] std::io::Error),
    #[error("host {0:?} is marked bad, deferring")]
    HostBad(String),
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub pool_size: usize,
    pub default_timeout: Duration,
    pub bad_host_window: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { pool_size: 4, default_timeout: Duration::from_secs(600), bad_host_window: Duration::from_secs(60) }
    }
}

/// Bounds concurrent external command execution and tracks hosts that
/// have recently failed with a network-class error.
pub struct Executor {
    config: ExecutorConfig,
    semaphore: Arc<Semaphore>,
    bad_hosts: Mutex<HashMap<String, tokio::time::Instant>>,
    initialized_hosts: Mutex<std::collections::HashSet<(String, String)>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            bad_hosts: Mutex::new(HashMap::new()),
            initialized_hosts: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Runs `cmd` (argv form, no shell) with the pool's concurrency
    /// limit applied, killing the whole process group if `deadline`
    /// elapses before the child exits.
    pub async fn run(&self, cmd: &[String], stdin: Option<&[u8]>, deadline: Duration) -> Result<ExecOutput, ExecutorError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore never closed");
        let [program, args @ ..] = cmd else {
            return Err(ExecutorError::Spawn("<empty command>".to_string(), std::io::Error::other("no argv[0]")));
        };

        let mut command = Command::new(program);
        command.args(args);
        command.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::other)?;
                    Ok(())
                });
            }
        }

        let mut child = command.spawn().map_err(|e| ExecutorError::Spawn(cmd.join(" "), e))?;
        let child_pid = child.id();

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input).await?;
            }
        }

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutput {
                exit_status: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Ok(Err(e)) => Err(ExecutorError::Io(e)),
            Err(_elapsed) => {
                if let Some(pid) = child_pid {
                    let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                warn!(cmd = %cmd.join(" "), ?deadline, "command timed out, killed process group");
                Err(ExecutorError::Timeout(cmd.join(" "), deadline))
            }
        }
    }

    pub async fn run_default_timeout(&self, cmd: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput, ExecutorError> {
        self.run(cmd, stdin, self.config.default_timeout).await
    }

    /// Acquires a pool slot and spawns `cmd`, returning as soon as the
    /// child process exists instead of waiting for it to exit: a
    /// submission failure (bad argv[0], exec error) surfaces to the
    /// caller immediately, while running the job to completion is left
    /// to [`TrackedJob::wait`] on whatever task the caller spawns it on.
    pub async fn spawn_tracked(self: &Arc<Self>, cmd: &[String]) -> Result<TrackedJob, ExecutorError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.expect("semaphore never closed");
        let [program, args @ ..] = cmd else {
            return Err(ExecutorError::Spawn("<empty command>".to_string(), std::io::Error::other("no argv[0]")));
        };

        let mut command = Command::new(program);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map_err(std::io::Error::other)?;
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(|e| ExecutorError::Spawn(cmd.join(" "), e))?;
        let child_pid = child.id();
        Ok(TrackedJob { _permit: permit, child, child_pid, cmd: cmd.join(" ") })
    }

    pub async fn mark_bad(&self, host: &str) {
        self.bad_hosts.lock().await.insert(host.to_string(), tokio::time::Instant::now());
    }

    pub async fn is_bad(&self, host: &str) -> bool {
        let mut bad = self.bad_hosts.lock().await;
        match bad.get(host) {
            Some(marked_at) if marked_at.elapsed() < self.config.bad_host_window => true,
            Some(_) => {
                bad.remove(host);
                false
            }
            None => false,
        }
    }

    pub async fn clear_bad_hosts(&self) {
        self.bad_hosts.lock().await.clear();
    }

    /// `true` if `(host, user)` has already had its service package
    /// pushed this run.
    pub async fn is_initialized(&self, host: &str, user: &str) -> bool {
        self.initialized_hosts.lock().await.contains(&(host.to_string(), user.to_string()))
    }

    pub async fn mark_initialized(&self, host: &str, user: &str) {
        self.initialized_hosts.lock().await.insert((host.to_string(), user.to_string()));
    }

    /// Scans `remote-init` output for the shared-filesystem UUID
    /// marker; if present the host shares the scheduler's filesystem and
    /// installation can be skipped.
    pub fn detects_shared_filesystem(marker: &str, remote_init_stdout: &[u8]) -> bool {
        String::from_utf8_lossy(remote_init_stdout).contains(marker)
    }
}

/// A spawned, not-yet-awaited job: holds its pool permit for the job's
/// full lifetime so background completion tracking still counts against
/// the pool's concurrency bound.
pub struct TrackedJob {
    _permit: tokio::sync::OwnedSemaphorePermit,
    child: tokio::process::Child,
    child_pid: Option<u32>,
    cmd: String,
}

impl TrackedJob {
    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Waits out the job, killing its process group if `deadline`
    /// elapses first, the same way [`Executor::run`] does.
    pub async fn wait(self, deadline: Duration) -> Result<ExecOutput, ExecutorError> {
        let TrackedJob { _permit, child, child_pid, cmd } = self;
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecOutput {
                exit_status: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            Ok(Err(e)) => Err(ExecutorError::Io(e)),
            Err(_elapsed) => {
                if let Some(pid) = child_pid {
                    let _ = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                warn!(cmd = %cmd, ?deadline, "command timed out, killed process group");
                Err(ExecutorError::Timeout(cmd, deadline))
            }
        }
    }
}
