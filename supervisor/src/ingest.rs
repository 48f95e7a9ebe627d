//! ActivityIngestor - turns heterogeneous triggers into `ActivityEvent`s.
//!
//! Webhook calls, local change observations and synthetic self-test pings
//! all end up as one normalized event type. Identical triggers that arrive
//! within the debounce window collapse into one logical event; a collapsed
//! trigger still reaches the supervisor when it carries a newer timestamp.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use shared_types::{
    ActivityEvent, ActivityRequest, ACTIVITY_KIND_LOCAL_CHANGE, ACTIVITY_KIND_SELF_TEST,
    ACTIVITY_KIND_WEBHOOK,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::{SupervisorHandle, SupervisorUnavailable};

const MAX_SOURCE_LEN: usize = 256;
const MAX_DETAIL_LEN: usize = 4096;
const MAX_KIND_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },
    #[error("invalid timestamp '{0}': expected ISO-8601 / RFC 3339")]
    InvalidTimestamp(String),
    #[error("malformed request body: {0}")]
    MalformedBody(String),
}

/// A raw signal that someone needs the worker.
#[derive(Debug, Clone)]
pub enum ActivityTrigger {
    Webhook {
        source: String,
        detail: String,
        timestamp: Option<DateTime<Utc>>,
        kind: Option<String>,
    },
    LocalChange {
        path: PathBuf,
    },
    SelfTest {
        sequence: u64,
    },
}

impl ActivityTrigger {
    /// Validate a `POST /activity` body.
    pub fn from_request(req: ActivityRequest) -> Result<Self, ValidationError> {
        let source = required(req.source, "source", MAX_SOURCE_LEN)?;
        let detail = required(req.detail, "detail", MAX_DETAIL_LEN)?;

        let timestamp = match req.timestamp.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| ValidationError::InvalidTimestamp(raw.to_string()))?
                    .with_timezone(&Utc),
            ),
        };

        let kind = match req.kind.map(|k| k.trim().to_string()) {
            Some(k) if k.len() > MAX_KIND_LEN => {
                return Err(ValidationError::TooLong {
                    field: "kind",
                    max: MAX_KIND_LEN,
                })
            }
            Some(k) if !k.is_empty() => Some(k),
            _ => None,
        };

        Ok(Self::Webhook {
            source,
            detail,
            timestamp,
            kind,
        })
    }

    /// Normalize into an event. Timestamps from the future are clamped to
    /// `now` so a skewed caller cannot pin the worker alive.
    pub fn into_event(self, now: DateTime<Utc>) -> ActivityEvent {
        match self {
            ActivityTrigger::Webhook {
                source,
                detail,
                timestamp,
                kind,
            } => {
                let timestamp = match timestamp {
                    Some(ts) if ts > now => {
                        warn!(%source, provided = %ts, "activity timestamp in the future; clamped");
                        now
                    }
                    Some(ts) => ts,
                    None => now,
                };
                ActivityEvent::new(
                    source,
                    detail,
                    kind.unwrap_or_else(|| ACTIVITY_KIND_WEBHOOK.to_string()),
                    timestamp,
                )
            }
            ActivityTrigger::LocalChange { path } => ActivityEvent::new(
                "local-change",
                path.display().to_string(),
                ACTIVITY_KIND_LOCAL_CHANGE,
                now,
            ),
            ActivityTrigger::SelfTest { sequence } => ActivityEvent::new(
                "self-test",
                format!("synthetic activity #{sequence}"),
                ACTIVITY_KIND_SELF_TEST,
                now,
            ),
        }
    }
}

fn required(value: Option<String>, field: &'static str, max: usize) -> Result<String, ValidationError> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ValidationError::MissingField(field))?;
    if value.len() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(value)
}

/// Outcome of running an event through the [`Debouncer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Debounced {
    /// First event of its burst.
    Admitted,
    /// Folded into the burst opened by `into`. `advances` is set when the
    /// event is newer than every timestamp the burst has carried so far; it
    /// must still be recorded so `lastActivityAt` keeps up.
    Collapsed { into: String, advances: bool },
}

#[derive(Debug)]
struct Burst {
    opened: Instant,
    id: String,
    newest: DateTime<Utc>,
}

/// Tracks the open burst per `(source, kind)`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    recent: HashMap<(String, String), Burst>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
        }
    }

    pub fn check(&mut self, event: &ActivityEvent, now: Instant) -> Debounced {
        if self.window.is_zero() {
            return Debounced::Admitted;
        }
        let window = self.window;
        self.recent
            .retain(|_, burst| now.saturating_duration_since(burst.opened) < window);

        let key = (event.source.clone(), event.kind.clone());
        if let Some(burst) = self.recent.get_mut(&key) {
            let advances = event.timestamp > burst.newest;
            if advances {
                burst.newest = event.timestamp;
            }
            return Debounced::Collapsed {
                into: burst.id.clone(),
                advances,
            };
        }
        self.recent.insert(
            key,
            Burst {
                opened: now,
                id: event.id.clone(),
                newest: event.timestamp,
            },
        );
        Debounced::Admitted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Recorded(ActivityEvent),
    Collapsed { into: String },
}

pub struct ActivityIngestor {
    supervisor: SupervisorHandle,
    debouncer: Mutex<Debouncer>,
}

impl ActivityIngestor {
    pub fn new(supervisor: SupervisorHandle, debounce: Duration) -> Self {
        Self {
            supervisor,
            debouncer: Mutex::new(Debouncer::new(debounce)),
        }
    }

    pub fn submit(&self, trigger: ActivityTrigger) -> Result<Ingested, SupervisorUnavailable> {
        let event = trigger.into_event(Utc::now());
        let verdict = self
            .debouncer
            .lock()
            .map_err(|_| SupervisorUnavailable("activity debouncer poisoned".to_string()))?
            .check(&event, Instant::now());

        match verdict {
            Debounced::Admitted => {
                self.supervisor.record_activity(event.clone())?;
                Ok(Ingested::Recorded(event))
            }
            Debounced::Collapsed { into, advances } => {
                debug!(source = %event.source, kind = %event.kind, %into, advances, "activity collapsed");
                if advances {
                    self.supervisor.record_activity(event)?;
                }
                Ok(Ingested::Collapsed { into })
            }
        }
    }
}

/// Self-test generator: submits `SelfTest` triggers at random intervals in
/// `[min, max]` until cancelled. Resolves to the number of triggers sent.
pub fn spawn_synthetic_activity(
    ingestor: Arc<ActivityIngestor>,
    min: Duration,
    max: Duration,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    let min_ms = min.as_millis() as u64;
    let max_ms = (max.as_millis() as u64).max(min_ms);
    tokio::spawn(async move {
        let mut sequence = 0;
        loop {
            let delay = Duration::from_millis(rand::rng().random_range(min_ms..=max_ms));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            sequence += 1;
            if let Err(e) = ingestor.submit(ActivityTrigger::SelfTest { sequence }) {
                warn!(error = %e, "synthetic activity rejected; stopping generator");
                break;
            }
        }
        sequence
    })
}
