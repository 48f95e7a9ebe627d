//! Minimal supervised worker.
//!
//! Serves `GET /health` -> `200 {"status":"healthy"}` on `$PORT` and exits
//! cleanly on SIGTERM. `STUB_WORKER_READY_DELAY_MS` delays readiness to
//! mimic a slow boot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use supervisor::shutdown::shutdown_signal;

async fn health(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, Json<serde_json::Value>) {
    if ready.load(Ordering::Acquire) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "healthy" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "starting" })),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "stub_worker=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8787".to_string())
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse PORT: {e}"))?;
    let ready_delay = std::env::var("STUB_WORKER_READY_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO);

    let ready = Arc::new(AtomicBool::new(ready_delay.is_zero()));
    if !ready_delay.is_zero() {
        let ready = Arc::clone(&ready);
        tokio::spawn(async move {
            tokio::time::sleep(ready_delay).await;
            ready.store(true, Ordering::Release);
        });
    }

    let app = Router::new().route("/health", get(health)).with_state(ready);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "stub worker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("stub worker exiting");
    Ok(())
}
