use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

const REAP_INTERVAL: Duration = Duration::from_secs(5);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Cancel pending bookings whose hold lapsed. Returns how many were cancelled.
pub async fn reap_once(engine: &Engine) -> usize {
    let now = now_ms();
    let mut reaped = 0;
    for id in engine.collect_expired_pending(now) {
        match engine.expire_pending(id, now).await {
            Ok(true) => {
                info!("expired pending booking {id}");
                reaped += 1;
            }
            // confirmed or cancelled in the meantime
            Ok(false) => {}
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }
    engine.notify.prune();
    reaped
}

/// Background task: sweep lapsed pending bookings every few seconds.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

/// Background task: rewrite the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
