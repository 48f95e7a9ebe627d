use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use supervisor::{
    api, config,
    health::{HealthProbe, HttpHealthProbe},
    ingest::ActivityIngestor,
    lifecycle::{spawn_supervisor, StopReason},
    persist,
    process::ProcessLauncher,
    shutdown::shutdown_signal,
    AppState,
};

/// Bound on the final stop during shutdown: grace period plus reap slack.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "supervisor=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    info!(
        port = config.port,
        worker = %config.worker.program,
        "supervisor starting"
    );

    let http_probe = HttpHealthProbe::new(
        config.worker_health_url.clone(),
        config.health_check_timeout,
    )?;
    info!(url = %http_probe.url(), "readiness probe configured");
    let probe: Arc<dyn HealthProbe> = Arc::new(http_probe);

    let (supervisor, actor_join) = spawn_supervisor(
        Some("lifecycle-supervisor".to_string()),
        config.supervisor.clone(),
        config.worker.clone(),
        Arc::new(ProcessLauncher),
        Arc::clone(&probe),
    )
    .await?;

    // Diagnostic status file
    let persist_cancel = CancellationToken::new();
    let status_writer = persist::spawn_status_writer(
        supervisor.clone(),
        config.status_file.clone(),
        config.status_persist_interval,
        persist_cancel.clone(),
    );

    let state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        ingestor: ActivityIngestor::new(supervisor.clone(), config.activity_debounce),
        probe,
        health_max_age: config.supervisor.health_check_interval * 2,
    });

    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Never leave an orphaned worker behind.
    info!("shutting down; stopping worker");
    let stop_budget = config.supervisor.stop_grace + SHUTDOWN_SLACK;
    match tokio::time::timeout(stop_budget, supervisor.stop_and_wait(StopReason::Shutdown)).await {
        Ok(Ok(())) => info!("worker stopped"),
        Ok(Err(e)) => warn!("final stop failed: {e}"),
        Err(_) => warn!("final stop timed out after {stop_budget:?}"),
    }

    persist_cancel.cancel();
    let _ = status_writer.await;

    supervisor.actor().stop(Some("shutdown".to_string()));
    let _ = actor_join.await;
    Ok(())
}
