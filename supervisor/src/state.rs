use std::sync::Arc;
use std::time::Duration;

use crate::health::HealthProbe;
use crate::ingest::ActivityIngestor;
use crate::lifecycle::SupervisorHandle;

pub struct AppState {
    pub supervisor: SupervisorHandle,
    pub ingestor: ActivityIngestor,
    /// Used by `GET /health` when the last recorded probe is stale.
    pub probe: Arc<dyn HealthProbe>,
    /// A recorded probe older than this is considered stale.
    pub health_max_age: Duration,
}
