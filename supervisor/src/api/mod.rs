use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared_types::{AcceptedResponse, ActivityRequest, ErrorResponse, HealthResponse, WorkerState};
use tracing::{error, warn};

use crate::ingest::{ActivityTrigger, Ingested, ValidationError};
use crate::lifecycle::SupervisorUnavailable;
use crate::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Unavailable(#[from] SupervisorUnavailable),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "supervisor_unavailable"),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            kind: kind.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(get_status))
        .route("/activity", post(post_activity))
        .route("/health", get(get_health))
        .route("/health/history", get(get_health_history))
        .route("/stop", post(post_stop))
}

/// GET /status: served from the published view; never waits on the mailbox
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.status())
}

/// POST /activity: validate, normalize, enqueue; never waits for the worker
pub async fn post_activity(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ActivityRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        ValidationError::MalformedBody(rejection.body_text())
    })?;
    let trigger = ActivityTrigger::from_request(request).inspect_err(|e| {
        warn!(error = %e, "rejected activity");
    })?;

    let body = match state.ingestor.submit(trigger) {
        Ok(Ingested::Recorded(event)) => AcceptedResponse {
            accepted: true,
            event_id: Some(event.id),
            collapsed: false,
        },
        Ok(Ingested::Collapsed { into }) => AcceptedResponse {
            accepted: true,
            event_id: Some(into),
            collapsed: true,
        },
        Err(e) => {
            error!("record activity: {e}");
            return Err(e.into());
        }
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

/// GET /health: latest probe, or a fresh one if the latest is stale
pub async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    let view = state.supervisor.view();

    if view.state == WorkerState::Failed {
        return unhealthy(
            view.error_detail
                .unwrap_or_else(|| "worker FAILED".to_string()),
        );
    }
    if !view.state.is_active() {
        return unhealthy(format!("worker is not running ({})", view.state));
    }

    let fresh = |checked_at: chrono::DateTime<Utc>| {
        (Utc::now() - checked_at)
            .to_std()
            .map_or(true, |age| age <= state.health_max_age)
    };
    let result = match view.last_health_check {
        Some(check) if fresh(check.timestamp) => check,
        _ => state.probe.check().await,
    };

    if result.healthy {
        let body = HealthResponse {
            healthy: true,
            latency_ms: Some(result.latency_ms),
            checked_at: Some(result.timestamp),
            error_detail: None,
        };
        (StatusCode::OK, Json(body)).into_response()
    } else {
        unhealthy(
            result
                .error_detail
                .unwrap_or_else(|| "worker unreachable".to_string()),
        )
    }
}

fn unhealthy(detail: String) -> Response {
    let body = HealthResponse {
        healthy: false,
        latency_ms: None,
        checked_at: None,
        error_detail: Some(detail),
    };
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

/// GET /health/history: the last K probe results, oldest first
pub async fn get_health_history(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.view().health_history)
}

/// POST /stop: enqueue an operator stop
pub async fn post_stop(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.supervisor.request_stop()?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            event_id: None,
            collapsed: false,
        }),
    ))
}
