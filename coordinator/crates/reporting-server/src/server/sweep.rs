use std::time::Duration;

use schema_reporting::{ReportingCoordinator, REPORTING_TARGET};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Runs the fleet sweep every `every`, for as long as the task is not aborted.
pub(super) fn spawn(coordinator: ReportingCoordinator, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            match coordinator.sweep().await {
                Ok(summary) if summary.marked_stale > 0 || summary.purged > 0 => {
                    tracing::info!(
                        target: REPORTING_TARGET,
                        marked_stale = summary.marked_stale,
                        purged = summary.purged,
                        "swept the fleet registry"
                    );
                }
                Ok(_) => (),
                Err(e) => tracing::warn!(target: REPORTING_TARGET, "fleet sweep failed: {e}"),
            }
        }
    })
}
