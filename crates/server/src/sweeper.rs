// Storage hygiene for expired locks and stale presence rows.
//
// Every read path already ignores expired rows, so a stopped or disabled sweep never changes
// what callers observe.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{locks::LockManager, presence::PresenceTracker};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub locks: u64,
    pub presence: u64,
}

/// One reclaim pass. Failures are logged and reported as zero.
pub async fn sweep_once(locks: &LockManager, presence: &PresenceTracker) -> SweepReport {
    let locks = locks.reclaim_expired().await.unwrap_or_else(|error| {
        warn!(error = %error, "expired lock sweep failed");
        0
    });
    let presence = presence.reclaim_stale().await.unwrap_or_else(|error| {
        warn!(error = %error, "stale presence sweep failed");
        0
    });

    SweepReport { locks, presence }
}

/// Sweeps on `interval` until `cancel` fires.
pub async fn run(locks: LockManager, presence: PresenceTracker, interval: Duration, cancel: CancellationToken) {
    info!(interval_secs = interval.as_secs(), "storage sweep started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep_once(&locks, &presence).await;
                if report == SweepReport::default() {
                    debug!("storage sweep found nothing to reclaim");
                } else {
                    info!(locks = report.locks, presence = report.presence, "storage sweep reclaimed rows");
                }
            }
        }
    }

    info!("storage sweep stopped");
}
