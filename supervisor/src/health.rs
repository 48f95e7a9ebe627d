use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shared_types::HealthCheckResult;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Probe cadence until a generation reports its first success.
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Readiness check against the worker.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// Never fails: timeouts and transport errors come back as unhealthy results.
    async fn check(&self) -> HealthCheckResult;
}

/// Probes `GET <url>` and expects `200 {"status":"healthy"}`.
pub struct HttpHealthProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            url: url.into(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> HealthCheckResult {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return HealthCheckResult::unhealthy(latency_ms, "readiness probe timed out")
            }
            Err(e) => {
                return HealthCheckResult::unhealthy(latency_ms, format!("transport error: {e}"))
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return HealthCheckResult::unhealthy(latency_ms, format!("unexpected status {status}"));
        }

        match response.json::<serde_json::Value>().await {
            Ok(body) if body.get("status").and_then(|v| v.as_str()) == Some("healthy") => {
                HealthCheckResult::healthy(latency_ms)
            }
            Ok(_) => HealthCheckResult::unhealthy(
                latency_ms,
                "readiness body missing status=healthy marker",
            ),
            Err(e) => {
                HealthCheckResult::unhealthy(latency_ms, format!("unreadable readiness body: {e}"))
            }
        }
    }
}

/// Ring buffer of the last K probe results, oldest first.
#[derive(Debug, Clone)]
pub struct HealthHistory {
    entries: VecDeque<HealthCheckResult>,
    capacity: usize,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, result: HealthCheckResult) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(result);
    }

    pub fn latest(&self) -> Option<&HealthCheckResult> {
        self.entries.back()
    }

    pub fn to_vec(&self) -> Vec<HealthCheckResult> {
        self.entries.iter().cloned().collect()
    }
}

/// Probe loop for one worker generation.
///
/// Probes quickly until the first healthy result, then every `interval`.
/// Stops when `cancel` fires or `on_result` returns false (receiver gone).
pub fn spawn_monitor<F>(
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    cancel: CancellationToken,
    on_result: F,
) -> JoinHandle<()>
where
    F: Fn(HealthCheckResult) -> bool + Send + 'static,
{
    let startup_interval = STARTUP_PROBE_INTERVAL.min(interval);
    tokio::spawn(async move {
        let mut ready = false;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = probe.check() => result,
            };
            ready |= result.healthy;
            if !on_result(result) {
                break;
            }
            let wait = if ready { interval } else { startup_interval };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }
        debug!("health monitor stopped");
    })
}
