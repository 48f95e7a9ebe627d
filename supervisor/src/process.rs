//! Worker process handle: spawn, terminate, and exit detection.
//!
//! Policy lives in the lifecycle actor. This module only knows how to start
//! an OS process, ask it to stop, and report when it is really gone.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    process::{Child, Command},
    sync::{oneshot, watch},
    time::timeout,
};
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the OS to confirm death after SIGKILL.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned worker has no pid (exited immediately)")]
    NoPid,
    #[error("failed to signal worker pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("worker pid {pid} still alive after forced kill")]
    Unkillable { pid: u32 },
    #[error("launch failed: {0}")]
    Launch(String),
}

/// What to run for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Split a whitespace-separated command line into program and args.
    pub fn parse(line: &str, env: Vec<(String, String)>) -> Result<Self, WorkerError> {
        let mut parts = line.split_whitespace().map(ToString::to_string);
        let program = parts.next().ok_or(WorkerError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            env,
        })
    }
}

/// How an exited worker went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub at: DateTime<Utc>,
}

impl ExitReport {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            at: Utc::now(),
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            at: Utc::now(),
        }
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// Which path `terminate` had to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPath {
    AlreadyExited,
    Graceful,
    Forced,
}

impl std::fmt::Display for TerminationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationPath::AlreadyExited => write!(f, "already-exited"),
            TerminationPath::Graceful => write!(f, "graceful"),
            TerminationPath::Forced => write!(f, "forced"),
        }
    }
}

/// A live (or recently live) worker process.
///
/// The `Child` is owned by a reaper task; the handle only holds the pid, a
/// kill switch, and the exit watch. Dropping the handle kills the process.
pub struct WorkerHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl WorkerHandle {
    pub fn from_child(mut child: Child) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(?pid, "failed to SIGKILL worker: {e}");
                    }
                    child.wait().await
                }
            };
            let report = match status {
                Ok(status) => ExitReport::from_status(status),
                Err(e) => {
                    error!(?pid, "failed to reap worker: {e}");
                    ExitReport::unknown()
                }
            };
            debug!(?pid, exit = %report, "worker reaped");
            let _ = exit_tx.send(Some(report));
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Receiver that flips to `Some` once the OS has reaped the process.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit_rx.clone()
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Returns once the process
    /// has been reaped, never merely after a signal was sent.
    pub async fn terminate(&mut self, grace: Duration) -> Result<TerminationPath, WorkerError> {
        if self.has_exited() {
            return Ok(TerminationPath::AlreadyExited);
        }
        let mut exit_rx = self.exit_rx.clone();

        if let Some(pid) = self.pid {
            send_graceful_stop(pid)?;
            if timeout(grace, wait_for_exit(&mut exit_rx)).await.is_ok() {
                return Ok(TerminationPath::Graceful);
            }
            warn!(pid, grace_ms = grace.as_millis() as u64, "worker ignored SIGTERM; escalating to SIGKILL");
        }

        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        match timeout(KILL_CONFIRM_TIMEOUT, wait_for_exit(&mut exit_rx)).await {
            Ok(_) => Ok(TerminationPath::Forced),
            Err(_) => Err(WorkerError::Unkillable {
                pid: self.pid.unwrap_or_default(),
            }),
        }
    }
}

async fn wait_for_exit(rx: &mut watch::Receiver<Option<ExitReport>>) -> ExitReport {
    match rx.wait_for(Option::is_some).await {
        Ok(report) => report.clone().unwrap_or_else(ExitReport::unknown),
        // Reaper gone without publishing: the child was dropped, and with it killed.
        Err(_) => ExitReport::unknown(),
    }
}

#[cfg(unix)]
fn send_graceful_stop(pid: u32) -> Result<(), WorkerError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| WorkerError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // Already gone; the reaper will publish the exit.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(WorkerError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_graceful_stop(_pid: u32) -> Result<(), WorkerError> {
    // No portable graceful signal; the grace wait still gives the worker a
    // chance to exit on its own before the forced kill.
    Ok(())
}

/// Seam between lifecycle policy and the OS.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, command: &WorkerCommand) -> Result<WorkerHandle, WorkerError>;
}

/// Launches the worker as a child process of the supervisor.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, command: &WorkerCommand) -> Result<WorkerHandle, WorkerError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let handle = WorkerHandle::from_child(child);
        let pid = handle.pid().ok_or(WorkerError::NoPid)?;
        info!(pid, program = %command.program, "worker process spawned");
        Ok(handle)
    }
}
