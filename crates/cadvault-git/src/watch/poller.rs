use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Background task that keeps observers in step with the remote.
///
/// Every `poll_interval` it syncs and broadcasts on change; every
/// `maintenance_interval` it purges stale locks. Stops once `shutdown`
/// turns true or its sender is dropped.
pub fn spawn_change_poller(
    coordinator: Coordinator,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = coordinator.config().clone();
        let mut poll = tokio::time::interval(config.poll_interval.max(MIN_INTERVAL));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance =
            tokio::time::interval(config.maintenance_interval.max(MIN_INTERVAL));
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Change poller started (poll every {:?}, maintenance every {:?})",
            config.poll_interval, config.maintenance_interval
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match coordinator.poll_and_notify().await {
                        Ok(true) => debug!("Remote change broadcast"),
                        Ok(false) => {}
                        Err(e) => warn!("Change poll failed: {}", e),
                    }
                }
                _ = maintenance.tick() => {
                    match coordinator.purge_stale_locks().await {
                        Ok(removed) if !removed.is_empty() => {
                            info!("Maintenance purged {} stale locks", removed.len())
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Lock maintenance failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Change poller stopped");
    })
}
