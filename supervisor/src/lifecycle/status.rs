use std::time::Duration;

use chrono::{DateTime, Utc};
use ractor::ActorRef;
use shared_types::{ActivityEvent, HealthCheckResult, SupervisorStatusSnapshot, WorkerState};
use tokio::sync::watch;

use super::{StopReason, SupervisorMsg};

/// Raw supervisor state, republished by the actor after every change.
///
/// Readers derive time-dependent fields (uptime, shutdown countdown) at read
/// time, so a stale view never needs the mailbox to be refreshed.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub state: WorkerState,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<HealthCheckResult>,
    pub running_since: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub pid: Option<u32>,
    pub generation: u64,
    pub restart_attempts: u32,
    pub consecutive_failures: u32,
    pub health_history: Vec<HealthCheckResult>,
    pub inactivity_timeout: Duration,
}

impl StatusView {
    pub fn initial(inactivity_timeout: Duration) -> Self {
        Self {
            state: WorkerState::Stopped,
            last_activity_at: None,
            last_health_check: None,
            running_since: None,
            error_detail: None,
            pid: None,
            generation: 0,
            restart_attempts: 0,
            consecutive_failures: 0,
            health_history: Vec::new(),
            inactivity_timeout,
        }
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> SupervisorStatusSnapshot {
        let serving = matches!(self.state, WorkerState::Running | WorkerState::Unhealthy);
        let uptime_seconds = match (serving, self.running_since) {
            (true, Some(since)) => (now - since).num_seconds().max(0) as u64,
            _ => 0,
        };
        let auto_shutdown_in_ms = match (serving, self.last_activity_at) {
            (true, Some(last)) => Some(
                chrono::Duration::from_std(self.inactivity_timeout)
                    .ok()
                    .and_then(|timeout| last.checked_add_signed(timeout))
                    .map(|deadline| (deadline - now).num_milliseconds().max(0) as u64)
                    .unwrap_or(u64::MAX),
            ),
            _ => None,
        };
        let healthy = self.state == WorkerState::Running
            && self
                .last_health_check
                .as_ref()
                .is_some_and(|check| check.healthy);

        SupervisorStatusSnapshot {
            state: self.state,
            last_activity_at: self.last_activity_at,
            last_health_check: self.last_health_check.clone(),
            healthy,
            uptime_seconds,
            auto_shutdown_in_ms,
            error_detail: self.error_detail.clone(),
            pid: self.pid,
            generation: self.generation,
            restart_attempts: self.restart_attempts,
            captured_at: now,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("supervisor unavailable: {0}")]
pub struct SupervisorUnavailable(pub String);

/// Cloneable front door to one supervisor.
///
/// Mutations are casts into the actor mailbox; reads come from the watch
/// channel and never wait on the mailbox.
#[derive(Clone)]
pub struct SupervisorHandle {
    actor: ActorRef<SupervisorMsg>,
    status: watch::Receiver<StatusView>,
}

impl SupervisorHandle {
    pub(crate) fn new(actor: ActorRef<SupervisorMsg>, status: watch::Receiver<StatusView>) -> Self {
        Self { actor, status }
    }

    pub fn actor(&self) -> &ActorRef<SupervisorMsg> {
        &self.actor
    }

    pub fn record_activity(&self, event: ActivityEvent) -> Result<(), SupervisorUnavailable> {
        self.actor
            .cast(SupervisorMsg::RecordActivity(event))
            .map_err(|e| SupervisorUnavailable(e.to_string()))
    }

    /// Enqueue an operator stop without waiting for it.
    pub fn request_stop(&self) -> Result<(), SupervisorUnavailable> {
        self.actor
            .cast(SupervisorMsg::Stop {
                reason: StopReason::Operator,
                reply: None,
            })
            .map_err(|e| SupervisorUnavailable(e.to_string()))
    }

    /// Stop the worker and wait until it is confirmed dead.
    pub async fn stop_and_wait(&self, reason: StopReason) -> Result<(), SupervisorUnavailable> {
        ractor::call!(self.actor, |reply| SupervisorMsg::Stop {
            reason,
            reply: Some(reply),
        })
        .map_err(|e| SupervisorUnavailable(e.to_string()))
    }

    pub fn view(&self) -> StatusView {
        self.status.borrow().clone()
    }

    pub fn status(&self) -> SupervisorStatusSnapshot {
        self.status.borrow().snapshot_at(Utc::now())
    }

    /// Wait until the published view satisfies `predicate`, or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<StatusView>
    where
        F: FnMut(&StatusView) -> bool,
    {
        let mut rx = self.status.clone();
        let fut = async move {
            rx.wait_for(|view| predicate(view))
                .await
                .ok()
                .map(|view| view.clone())
        };
        tokio::time::timeout(timeout, fut).await.ok().flatten()
    }
}
