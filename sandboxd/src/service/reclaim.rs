//! Reclaim loop: stop idle boxes, delete long-stopped ones.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use sandboxd_shared::errors::SandboxResult;

use crate::backend::BoxBackend;
use crate::backend::types::BoxStatus;
use crate::service::tracker::AccessTracker;

/// Graceful stop timeout applied to reclaim stops.
const RECLAIM_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// The scan interval never drops below this.
const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one reclaim cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimReport {
    pub stopped_count: usize,
    pub deleted_count: usize,
    pub stopped_ids: Vec<String>,
    pub deleted_ids: Vec<String>,
}

/// One pass over every box the backend lists.
///
/// Per-box failures are logged and never abort the cycle. First-seen ids
/// are skipped: the tracker initializes them to now, so they only become
/// candidates after a full idle window.
pub(crate) async fn reclaim_cycle(
    backend: &Arc<dyn BoxBackend>,
    tracker: &AccessTracker,
    stop_threshold: Duration,
    delete_threshold: Duration,
) -> SandboxResult<ReclaimReport> {
    let boxes = backend.list(&[]).await?;
    let mut report = ReclaimReport::default();

    for info in boxes {
        let (last_access, existed) = tracker.last_accessed(&info.id);
        if !existed {
            continue;
        }
        let idle = last_access.elapsed();

        match info.status {
            BoxStatus::Running if idle >= stop_threshold => {
                match backend.stop(&info.id, Some(RECLAIM_STOP_TIMEOUT)).await {
                    Ok(_) => {
                        tracing::info!(box_id = %info.id, idle = ?idle, "reclaimed: stopped idle box");
                        report.stopped_ids.push(info.id);
                        // The tracker entry stays: the delete threshold
                        // still has to fire for this box.
                    }
                    Err(e) => {
                        tracing::warn!(box_id = %info.id, error = %e, "reclaim stop failed");
                    }
                }
            }
            BoxStatus::Stopped if idle >= delete_threshold => {
                match backend.delete(&info.id, false).await {
                    Ok(()) => {
                        tracing::info!(box_id = %info.id, idle = ?idle, "reclaimed: deleted stopped box");
                        tracker.remove(&info.id);
                        report.deleted_ids.push(info.id);
                    }
                    Err(e) => {
                        tracing::warn!(box_id = %info.id, error = %e, "reclaim delete failed");
                    }
                }
            }
            _ => {}
        }
    }

    report.stopped_count = report.stopped_ids.len();
    report.deleted_count = report.deleted_ids.len();
    Ok(report)
}

/// Spawn the periodic reclaim task; it exits when `shutdown` flips.
pub(crate) fn spawn_reclaim_loop(
    backend: Arc<dyn BoxBackend>,
    tracker: Arc<AccessTracker>,
    stop_threshold: Duration,
    delete_threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = stop_threshold.min(delete_threshold).max(MIN_SCAN_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; skip it so a restart does not
        // scan before anyone had a chance to touch their boxes.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match reclaim_cycle(&backend, &tracker, stop_threshold, delete_threshold).await {
                        Ok(report) if report.stopped_count + report.deleted_count > 0 => {
                            tracing::info!(
                                stopped = report.stopped_count,
                                deleted = report.deleted_count,
                                "reclaim cycle finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "reclaim cycle failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
