//! Shared fixtures for supervisor integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{ActivityEvent, HealthCheckResult, ACTIVITY_KIND_WEBHOOK};
use tokio::sync::watch;

use supervisor::config::SupervisorSettings;
use supervisor::health::HealthProbe;
use supervisor::lifecycle::{spawn_supervisor, StopReason, SupervisorHandle};
use supervisor::process::{
    ExitReport, ProcessLauncher, WorkerCommand, WorkerError, WorkerHandle, WorkerLauncher,
};

/// Settings scaled down so lifecycle scenarios finish in well under a second.
pub fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        inactivity_timeout: Duration::from_secs(10),
        health_check_interval: Duration::from_millis(50),
        startup_grace: Duration::from_secs(2),
        max_restart_attempts: 3,
        unhealthy_threshold: 3,
        stop_grace: Duration::from_secs(1),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
        health_history_len: 16,
    }
}

/// A worker that stays up until signalled.
pub fn sleeper() -> WorkerCommand {
    WorkerCommand {
        program: "sleep".to_string(),
        args: vec!["30".to_string()],
        env: Vec::new(),
    }
}

/// A worker that dies on its own after `secs`.
pub fn short_lived(secs: &str) -> WorkerCommand {
    WorkerCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), format!("sleep {secs}; exit 1")],
        env: Vec::new(),
    }
}

pub fn activity(source: &str) -> ActivityEvent {
    ActivityEvent::new(source, "test activity", ACTIVITY_KIND_WEBHOOK, Utc::now())
}

/// Readiness probe whose answers the test controls.
pub struct ScriptedProbe {
    healthy: AtomicBool,
    fail_next: AtomicU32,
    checks: AtomicUsize,
}

impl ScriptedProbe {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            checks: AtomicUsize::new(0),
        })
    }

    pub fn down() -> Arc<Self> {
        let probe = Self::healthy();
        probe.set_healthy(false);
        probe
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The next `n` checks fail, then the steady answer resumes.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self) -> HealthCheckResult {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            HealthCheckResult::unhealthy(1, "scripted probe failure")
        } else if self.healthy.load(Ordering::SeqCst) {
            HealthCheckResult::healthy(1)
        } else {
            HealthCheckResult::unhealthy(1, "scripted: worker down")
        }
    }
}

/// Real process launcher that records every launch and flags any launch
/// that happens while an earlier instance is still alive.
pub struct RecordingLauncher {
    inner: ProcessLauncher,
    /// Per-launch command overrides; launches past the end use the configured command.
    overrides: Vec<WorkerCommand>,
    delay: Duration,
    launches: AtomicUsize,
    overlaps: AtomicUsize,
    exits: Mutex<Vec<watch::Receiver<Option<ExitReport>>>>,
}

impl RecordingLauncher {
    pub fn new() -> Arc<Self> {
        Self::build(Vec::new(), Duration::ZERO)
    }

    pub fn with_overrides(overrides: Vec<WorkerCommand>) -> Arc<Self> {
        Self::build(overrides, Duration::ZERO)
    }

    /// Every launch stalls for `delay` first, keeping the actor busy.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(Vec::new(), delay)
    }

    fn build(overrides: Vec<WorkerCommand>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: ProcessLauncher,
            overrides,
            delay,
            launches: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            exits: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.exits
            .lock()
            .unwrap()
            .iter()
            .filter(|rx| rx.borrow().is_none())
            .count()
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, command: &WorkerCommand) -> Result<WorkerHandle, WorkerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.live_workers() > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        let command = self.overrides.get(index).unwrap_or(command);
        let handle = self.inner.launch(command).await?;
        self.exits.lock().unwrap().push(handle.exit_watch());
        Ok(handle)
    }
}

/// Launcher whose spawns always fail, recording when each attempt happened.
#[derive(Default)]
pub struct FailingLauncher {
    attempts: Mutex<Vec<Instant>>,
}

impl FailingLauncher {
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for FailingLauncher {
    async fn launch(&self, _command: &WorkerCommand) -> Result<WorkerHandle, WorkerError> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(WorkerError::Launch("simulated spawn failure".to_string()))
    }
}

pub async fn start_supervisor(
    settings: SupervisorSettings,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn HealthProbe>,
) -> SupervisorHandle {
    let (handle, _join) = spawn_supervisor(None, settings, sleeper(), launcher, probe)
        .await
        .expect("supervisor should spawn");
    handle
}

pub async fn shutdown(handle: &SupervisorHandle) {
    handle
        .stop_and_wait(StopReason::Shutdown)
        .await
        .expect("final stop");
    handle.actor().stop(None);
}
