use std::path::{Path, PathBuf};
use std::time::Duration;

use shared_types::SupervisorStatusSnapshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lifecycle::SupervisorHandle;

/// Write `snapshot` as pretty JSON. Goes through a temp file + rename so
/// readers never observe a half-written file.
pub async fn write_snapshot(path: &Path, snapshot: &SupervisorStatusSnapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Background task: diagnostic status file, refreshed every `interval`.
///
/// The file is for external tooling only and is never read back. A final
/// snapshot is written when `cancel` fires.
pub fn spawn_status_writer(
    supervisor: SupervisorHandle,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let stopping = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = ticker.tick() => false,
            };
            let snapshot = supervisor.status();
            match write_snapshot(&path, &snapshot).await {
                Ok(()) => debug!(path = %path.display(), state = %snapshot.state, "status snapshot written"),
                Err(e) => warn!(path = %path.display(), "failed to write status snapshot: {e}"),
            }
            if stopping {
                break;
            }
        }
    })
}
