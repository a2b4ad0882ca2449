use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::engine::Engine;

/// Background task that periodically retires past-dated, unbooked Available
/// slots. Runs outside the request path but goes through the same locked
/// transition as interactive cancellation, so it cannot race a concurrent
/// claim into an inconsistent state.
pub async fn run_reaper(engine: Arc<Engine>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        interval.tick().await;
        let today = Utc::now().date_naive();
        let due = engine.collect_expired_slots(today);
        if due.is_empty() {
            continue;
        }
        let mut reaped = 0usize;
        for id in due {
            match engine.expire_slot(id, today).await {
                Ok(true) => reaped += 1,
                // Booked, blocked or deleted between sweep and lock — leave it
                Ok(false) => debug!("reaper skip {id}: no longer expirable"),
                Err(e) => debug!("reaper skip {id}: {e}"),
            }
        }
        if reaped > 0 {
            info!("reaped {reaped} expired slot(s)");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
