//! Shared types between the supervisor and its callers
//!
//! These types are used by both:
//! - the lifecycle supervisor (actor state, status publication)
//! - external callers of the control API (dashboards, webhook relays)
//!
//! Serializable with serde for JSON over HTTP and for the status file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Worker State
// ============================================================================

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    /// At least one probe failed since the last success; still serving.
    Unhealthy,
    Stopping,
    /// Worker died or failed to come up; a retry may be pending.
    Crashed,
    /// Restart attempts exhausted. Needs new activity or an operator stop.
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "STOPPED",
            WorkerState::Starting => "STARTING",
            WorkerState::Running => "RUNNING",
            WorkerState::Unhealthy => "UNHEALTHY",
            WorkerState::Stopping => "STOPPING",
            WorkerState::Crashed => "CRASHED",
            WorkerState::Failed => "FAILED",
        }
    }

    /// States in which a worker process is expected to be alive and probed.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerState::Starting | WorkerState::Running | WorkerState::Unhealthy
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Activity
// ============================================================================

pub const ACTIVITY_KIND_WEBHOOK: &str = "webhook";
pub const ACTIVITY_KIND_LOCAL_CHANGE: &str = "local_change";
pub const ACTIVITY_KIND_SELF_TEST: &str = "self_test";

/// A normalized signal that an external consumer needs the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEvent {
    pub id: String,
    pub source: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
}

impl ActivityEvent {
    pub fn new(
        source: impl Into<String>,
        detail: impl Into<String>,
        kind: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            detail: detail.into(),
            timestamp,
            kind: kind.into(),
        }
    }
}

/// Body of `POST /activity`.
///
/// Every field is optional at the serde level so that missing fields are
/// reported as validation errors rather than deserialization failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    /// ISO-8601; defaults to receipt time.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// True when the trigger was folded into a recent identical event.
    #[serde(default)]
    pub collapsed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

// ============================================================================
// Health
// ============================================================================

/// Outcome of one readiness probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            healthy: true,
            latency_ms,
            error_detail: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            healthy: false,
            latency_ms,
            error_detail: Some(detail.into()),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

// ============================================================================
// Status
// ============================================================================

/// Point-in-time view of the supervisor, served by `GET /status` and
/// written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatusSnapshot {
    pub state: WorkerState,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<HealthCheckResult>,
    pub healthy: bool,
    pub uptime_seconds: u64,
    /// Milliseconds until the inactivity stop fires; `None` unless running.
    pub auto_shutdown_in_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub generation: u64,
    pub restart_attempts: u32,
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// Tests
// ============================================================================
