// Periodic reconciliation
//
// Runs the reconciler on a fixed interval. A tick that lands while another run
// (scheduled or admin-triggered) is still in progress is skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::services::PositionService;

/// Spawn the background reconciliation loop
///
/// The first run happens one `interval` after startup.
pub fn spawn_reconcile_loop(service: Arc<PositionService>, interval: Duration) -> JoinHandle<()> {
    tracing::info!(interval_secs = interval.as_secs(), "scheduled reconciliation enabled");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match service.try_reconcile().await {
                None => {
                    tracing::debug!("reconciliation already running, skipping tick");
                }
                Some(Ok(report)) => {
                    tracing::info!(
                        records = report.records_processed,
                        changed = report.changed_count,
                        tier_changes = report.tier_changes,
                        last_position = report.new_last_position,
                        duration_ms = report.duration_ms,
                        "scheduled reconciliation finished"
                    );
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, code = e.code(), "scheduled reconciliation failed");
                }
            }
        }
    })
}
