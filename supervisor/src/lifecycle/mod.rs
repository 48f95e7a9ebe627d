//! LifecycleSupervisor - single writer of the worker's lifecycle state.
//!
//! Activity, probe results, exit notifications, timer ticks and operator
//! requests all arrive as `SupervisorMsg`s in one ractor mailbox. Only the
//! handler below mutates `WorkerState`; everyone else reads the published
//! `StatusView` or casts a message.

mod status;

pub use status::{StatusView, SupervisorHandle, SupervisorUnavailable};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{ActivityEvent, HealthCheckResult, WorkerState};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorSettings;
use crate::health::{spawn_monitor, HealthHistory, HealthProbe};
use crate::process::{ExitReport, WorkerCommand, WorkerHandle, WorkerLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `POST /stop` or an equivalent operator request.
    Operator,
    /// The supervisor daemon is shutting down.
    Shutdown,
}

#[derive(Debug)]
pub enum SupervisorMsg {
    /// External activity; may bring the worker up.
    RecordActivity(ActivityEvent),
    /// Backoff elapsed for a scheduled restart. Stale epochs are ignored.
    RetryStart { epoch: u64 },
    HealthChecked {
        generation: u64,
        result: HealthCheckResult,
    },
    /// The OS reaped a worker the supervisor did not ask to stop.
    WorkerExited { generation: u64, exit: ExitReport },
    /// Periodic tick: inactivity stop and startup deadline.
    EvaluateInactivity,
    Stop {
        reason: StopReason,
        reply: Option<RpcReplyPort<()>>,
    },
}

pub struct SupervisorArguments {
    pub settings: SupervisorSettings,
    pub command: WorkerCommand,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub probe: Arc<dyn HealthProbe>,
    pub status_tx: watch::Sender<StatusView>,
}

struct ActiveWorker {
    handle: WorkerHandle,
    generation: u64,
    monitor_cancel: CancellationToken,
    exit_watcher: JoinHandle<()>,
}

pub struct SupervisorState {
    settings: SupervisorSettings,
    command: WorkerCommand,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn HealthProbe>,
    status_tx: watch::Sender<StatusView>,
    state: WorkerState,
    worker: Option<ActiveWorker>,
    generation: u64,
    last_activity_at: Option<DateTime<Utc>>,
    history: HealthHistory,
    consecutive_failures: u32,
    restart_attempts: u32,
    /// Bumped whenever a pending retry must be invalidated.
    retry_epoch: u64,
    retry_pending: bool,
    startup_deadline: Option<Instant>,
    running_since: Option<DateTime<Utc>>,
    error_detail: Option<String>,
    ticker: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub struct LifecycleSupervisor;

/// Spawn a supervisor actor and return a handle to it.
pub async fn spawn_supervisor(
    name: Option<String>,
    settings: SupervisorSettings,
    command: WorkerCommand,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn HealthProbe>,
) -> anyhow::Result<(SupervisorHandle, JoinHandle<()>)> {
    let (status_tx, status_rx) = watch::channel(StatusView::initial(settings.inactivity_timeout));
    let args = SupervisorArguments {
        settings,
        command,
        launcher,
        probe,
        status_tx,
    };
    let (actor, join) = Actor::spawn(name, LifecycleSupervisor, args).await?;
    Ok((SupervisorHandle::new(actor, status_rx), join))
}

#[async_trait]
impl Actor for LifecycleSupervisor {
    type Msg = SupervisorMsg;
    type State = SupervisorState;
    type Arguments = SupervisorArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let interval = args.settings.health_check_interval;
        let tick_ref = myself.clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tick_ref.cast(SupervisorMsg::EvaluateInactivity).is_err() {
                    break;
                }
            }
        });

        info!(
            program = %args.command.program,
            inactivity_timeout_ms = args.settings.inactivity_timeout.as_millis() as u64,
            "lifecycle supervisor ready"
        );

        Ok(SupervisorState {
            history: HealthHistory::new(args.settings.health_history_len),
            settings: args.settings,
            command: args.command,
            launcher: args.launcher,
            probe: args.probe,
            status_tx: args.status_tx,
            state: WorkerState::Stopped,
            worker: None,
            generation: 0,
            last_activity_at: None,
            consecutive_failures: 0,
            restart_attempts: 0,
            retry_epoch: 0,
            retry_pending: false,
            startup_deadline: None,
            running_since: None,
            error_detail: None,
            ticker: Some(ticker),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMsg::RecordActivity(event) => state.record_activity(&myself, event).await,
            SupervisorMsg::RetryStart { epoch } => state.retry_start(&myself, epoch).await,
            SupervisorMsg::HealthChecked { generation, result } => {
                state.on_health_check(&myself, generation, result).await
            }
            SupervisorMsg::WorkerExited { generation, exit } => {
                state.on_worker_exit(&myself, generation, exit).await
            }
            SupervisorMsg::EvaluateInactivity => {
                state.evaluate_inactivity(&myself, Utc::now()).await
            }
            SupervisorMsg::Stop { reason, reply } => {
                state.stop(reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
        state.publish();
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
        if state.worker.is_some() {
            state.stop(StopReason::Shutdown).await;
            state.publish();
        }
        Ok(())
    }
}

impl SupervisorState {
    fn publish(&self) {
        self.status_tx.send_replace(StatusView {
            state: self.state,
            last_activity_at: self.last_activity_at,
            last_health_check: self.history.latest().cloned(),
            running_since: self.running_since,
            error_detail: self.error_detail.clone(),
            pid: self.worker.as_ref().and_then(|w| w.handle.pid()),
            generation: self.generation,
            restart_attempts: self.restart_attempts,
            consecutive_failures: self.consecutive_failures,
            health_history: self.history.to_vec(),
            inactivity_timeout: self.settings.inactivity_timeout,
        });
    }

    /// Every transition is published immediately so `/status` sees
    /// STARTING/STOPPING while a spawn or terminate is still in flight.
    fn transition(&mut self, to: WorkerState, reason: &str) {
        if self.state == to {
            return;
        }
        info!(from = %self.state, to = %to, generation = self.generation, reason, "worker state transition");
        self.state = to;
        self.publish();
    }

    fn activity_is_recent(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_activity_at else {
            return false;
        };
        let idle = (now - last).to_std().unwrap_or(Duration::ZERO);
        idle <= self.settings.inactivity_timeout
    }

    fn cancel_pending_retry(&mut self) {
        self.retry_epoch += 1;
        self.retry_pending = false;
    }

    async fn record_activity(&mut self, myself: &ActorRef<SupervisorMsg>, event: ActivityEvent) {
        let advanced = self.last_activity_at.map_or(true, |last| event.timestamp > last);
        if advanced {
            self.last_activity_at = Some(event.timestamp);
        }
        debug!(id = %event.id, source = %event.source, kind = %event.kind, advanced, "activity recorded");

        // Activity already past the inactivity timeout never starts a worker.
        if !self.activity_is_recent(Utc::now()) {
            debug!(id = %event.id, last_activity_at = ?self.last_activity_at, state = %self.state, "activity too old to start a worker");
            return;
        }

        match self.state {
            WorkerState::Stopped => self.start(myself).await,
            WorkerState::Failed => {
                info!("new activity after FAILED; resetting restart attempts");
                self.restart_attempts = 0;
                self.start(myself).await;
            }
            // A scheduled retry will pick the new activity up.
            WorkerState::Crashed if self.retry_pending => {}
            WorkerState::Crashed => self.start(myself).await,
            _ => {}
        }
    }

    async fn start(&mut self, myself: &ActorRef<SupervisorMsg>) {
        if let Some(worker) = &self.worker {
            error!(
                generation = worker.generation,
                pid = ?worker.handle.pid(),
                state = %self.state,
                "invariant violation: start requested while a worker is still alive; ignoring"
            );
            return;
        }
        self.cancel_pending_retry();
        self.generation += 1;
        let generation = self.generation;
        self.startup_deadline = Some(Instant::now() + self.settings.startup_grace);
        self.consecutive_failures = 0;
        self.transition(WorkerState::Starting, "activity requires worker");

        match self.launcher.launch(&self.command).await {
            Ok(handle) => {
                let monitor_cancel = CancellationToken::new();
                let health_ref = myself.clone();
                spawn_monitor(
                    Arc::clone(&self.probe),
                    self.settings.health_check_interval,
                    monitor_cancel.clone(),
                    move |result| {
                        health_ref
                            .cast(SupervisorMsg::HealthChecked { generation, result })
                            .is_ok()
                    },
                );

                let mut exit_rx = handle.exit_watch();
                let exit_ref = myself.clone();
                let exit_watcher = tokio::spawn(async move {
                    let exit = match exit_rx.wait_for(Option::is_some).await {
                        Ok(report) => report.clone(),
                        Err(_) => None,
                    };
                    if let Some(exit) = exit {
                        let _ = exit_ref.cast(SupervisorMsg::WorkerExited { generation, exit });
                    }
                });

                info!(generation, pid = ?handle.pid(), "worker spawned; awaiting first healthy probe");
                self.worker = Some(ActiveWorker {
                    handle,
                    generation,
                    monitor_cancel,
                    exit_watcher,
                });
            }
            Err(e) => {
                warn!(generation, error = %e, "worker spawn failed");
                self.escalate_failure(myself, format!("spawn failed: {e}"))
                    .await;
            }
        }
    }

    /// Stop the current worker (if any) and wait for confirmed death.
    async fn teardown(&mut self) {
        self.startup_deadline = None;
        self.running_since = None;
        self.consecutive_failures = 0;
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.monitor_cancel.cancel();
        worker.exit_watcher.abort();
        let pid = worker.handle.pid();
        match worker.handle.terminate(self.settings.stop_grace).await {
            Ok(path) => info!(generation = worker.generation, ?pid, %path, "worker terminated"),
            Err(e) => error!(generation = worker.generation, ?pid, error = %e, "worker termination failed"),
        }
    }

    async fn stop_worker(&mut self, reason: &str) {
        self.transition(WorkerState::Stopping, reason);
        self.teardown().await;
        self.transition(WorkerState::Stopped, reason);
    }

    /// A start attempt (or a running worker) failed. Retry with backoff,
    /// settle at STOPPED if nobody needs the worker, or give up.
    async fn escalate_failure(&mut self, myself: &ActorRef<SupervisorMsg>, detail: String) {
        self.teardown().await;
        self.restart_attempts += 1;
        self.error_detail = Some(detail);

        if self.restart_attempts >= self.settings.max_restart_attempts {
            self.cancel_pending_retry();
            self.transition(WorkerState::Failed, "restart attempts exhausted");
            error!(
                attempts = self.restart_attempts,
                error = self.error_detail.as_deref().unwrap_or_default(),
                "worker FAILED; waiting for new activity or operator stop"
            );
            return;
        }

        self.transition(WorkerState::Crashed, "worker failure");
        if !self.activity_is_recent(Utc::now()) {
            self.transition(WorkerState::Stopped, "no recent activity; not restarting");
            return;
        }

        self.cancel_pending_retry();
        self.retry_pending = true;
        let epoch = self.retry_epoch;
        let delay = self.settings.backoff_for(self.restart_attempts);
        info!(attempt = self.restart_attempts, delay_ms = delay.as_millis() as u64, "restart scheduled");
        let retry_ref = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = retry_ref.cast(SupervisorMsg::RetryStart { epoch });
        });
    }

    async fn retry_start(&mut self, myself: &ActorRef<SupervisorMsg>, epoch: u64) {
        if !self.retry_pending || epoch != self.retry_epoch {
            debug!(epoch, current = self.retry_epoch, "stale restart ignored");
            return;
        }
        self.retry_pending = false;
        if self.state != WorkerState::Crashed {
            return;
        }
        if self.activity_is_recent(Utc::now()) {
            self.start(myself).await;
        } else {
            self.transition(WorkerState::Stopped, "inactivity superseded pending restart");
        }
    }

    async fn on_health_check(
        &mut self,
        myself: &ActorRef<SupervisorMsg>,
        generation: u64,
        result: HealthCheckResult,
    ) {
        let current = self.worker.as_ref().map(|w| w.generation);
        if current != Some(generation) {
            debug!(generation, ?current, "probe result from a stale generation ignored");
            return;
        }
        let healthy = result.healthy;
        let detail = result.error_detail.clone();
        self.history.push(result);

        match (self.state, healthy) {
            (WorkerState::Starting, true) => {
                self.startup_deadline = None;
                self.running_since = Some(Utc::now());
                self.restart_attempts = 0;
                self.error_detail = None;
                self.transition(WorkerState::Running, "first healthy probe");
            }
            (WorkerState::Starting, false) => {
                let expired = self
                    .startup_deadline
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if expired {
                    self.startup_timed_out(myself, detail).await;
                }
            }
            (WorkerState::Running | WorkerState::Unhealthy, true) => {
                if self.consecutive_failures > 0 {
                    info!(failures = self.consecutive_failures, "worker recovered");
                }
                self.consecutive_failures = 0;
                self.transition(WorkerState::Running, "probe recovered");
            }
            (WorkerState::Running | WorkerState::Unhealthy, false) => {
                self.consecutive_failures += 1;
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.settings.unhealthy_threshold,
                    error = detail.as_deref().unwrap_or_default(),
                    "readiness probe failed"
                );
                self.transition(WorkerState::Unhealthy, "probe failed");
                if self.consecutive_failures >= self.settings.unhealthy_threshold {
                    self.restart_unhealthy(myself).await;
                }
            }
            _ => {}
        }
    }

    async fn startup_timed_out(&mut self, myself: &ActorRef<SupervisorMsg>, detail: Option<String>) {
        let grace_ms = self.settings.startup_grace.as_millis();
        let detail = match detail {
            Some(d) => format!("no healthy probe within {grace_ms}ms of spawn: {d}"),
            None => format!("no healthy probe within {grace_ms}ms of spawn"),
        };
        warn!(generation = self.generation, "{detail}");
        self.escalate_failure(myself, detail).await;
    }

    async fn restart_unhealthy(&mut self, myself: &ActorRef<SupervisorMsg>) {
        warn!(
            generation = self.generation,
            failures = self.consecutive_failures,
            "unhealthy past threshold; restarting worker"
        );
        self.error_detail = Some(format!(
            "restarted after {} consecutive failed probes",
            self.consecutive_failures
        ));
        self.stop_worker("unhealthy past threshold").await;
        self.start(myself).await;
    }

    async fn on_worker_exit(
        &mut self,
        myself: &ActorRef<SupervisorMsg>,
        generation: u64,
        exit: ExitReport,
    ) {
        let current = self.worker.as_ref().map(|w| w.generation);
        if current != Some(generation) {
            debug!(generation, ?current, exit = %exit, "exit of a superseded worker ignored");
            return;
        }
        warn!(generation, prior = %self.state, exit = %exit, "worker exited unexpectedly");
        self.transition(WorkerState::Crashed, "unsolicited exit");
        // Already reaped, so the teardown inside escalate_failure returns at once.
        self.escalate_failure(myself, format!("worker exited unexpectedly ({exit})"))
            .await;
    }

    async fn evaluate_inactivity(&mut self, myself: &ActorRef<SupervisorMsg>, now: DateTime<Utc>) {
        let recent = self.activity_is_recent(now);
        match self.state {
            WorkerState::Running | WorkerState::Unhealthy if !recent => {
                info!(
                    last_activity_at = ?self.last_activity_at,
                    "inactivity timeout reached; stopping worker"
                );
                self.stop_worker("inactivity timeout").await;
            }
            WorkerState::Starting if !recent => {
                self.stop_worker("inactivity superseded in-flight start").await;
            }
            WorkerState::Starting => {
                let expired = self
                    .startup_deadline
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if expired {
                    let detail = self
                        .history
                        .latest()
                        .and_then(|check| check.error_detail.clone());
                    self.startup_timed_out(myself, detail).await;
                }
            }
            WorkerState::Crashed if self.retry_pending && !recent => {
                self.cancel_pending_retry();
                self.transition(WorkerState::Stopped, "inactivity superseded pending restart");
            }
            _ => {}
        }
    }

    async fn stop(&mut self, reason: StopReason) {
        self.cancel_pending_retry();
        let why = match reason {
            StopReason::Operator => "operator stop",
            StopReason::Shutdown => "supervisor shutdown",
        };
        if self.worker.is_some() {
            self.stop_worker(why).await;
        } else if self.state != WorkerState::Stopped {
            self.transition(WorkerState::Stopped, why);
        }
        if reason == StopReason::Operator {
            self.restart_attempts = 0;
            self.error_detail = None;
        }
    }
}
