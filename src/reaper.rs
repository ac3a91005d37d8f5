use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};
use crate::model::Ms;
use crate::observability;

/// One sweep: claim every overdue PENDING reservation, expire the ones this
/// worker won, and give the claim back when expiry fails. Returns how many
/// reservations this worker expired.
pub async fn sweep_expired(engine: &Engine, worker: &str, now: Ms) -> usize {
    let mut expired = 0;
    for id in engine.collect_expired_reservations(now) {
        if !engine.claim_for_expiry(&id, worker, now) {
            debug!("sweeper {worker}: {id} claimed elsewhere");
            continue;
        }
        match engine.expire_reservation(id, worker, now).await {
            Ok(r) => {
                info!("expired reservation {id} ({} units, reference {})", r.quantity(), r.reference_id);
                expired += 1;
            }
            Err(e) => {
                // Usually lost a race with confirm or cancel.
                debug!("sweeper {worker}: skip {id}: {e}");
                engine.release_expiry_claim(&id, worker);
            }
        }
    }
    if expired > 0 {
        metrics::counter!(observability::RESERVATIONS_EXPIRED_TOTAL).increment(expired as u64);
    }
    expired
}

/// Background expiration sweeper.
pub async fn run_reaper(engine: Arc<Engine>, worker: String, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let n = sweep_expired(&engine, &worker, now_ms()).await;
        if n > 0 {
            info!("sweeper {worker}: expired {n} reservations");
        }
        engine.notify.prune();
    }
}

/// Background WAL compactor: compacts once `threshold` appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
