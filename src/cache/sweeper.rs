//! One clock-sweep pass per shard: the background eviction loop that
//! reclaims cold, unguarded pages whose revision has fallen behind the
//! epoch tracker's low watermark.

use crate::cache::BufferPool;
use crate::epoch::RevisionEpochTracker;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Spawns the background task for one shard. Returns immediately; the
/// loop runs until `cancel` fires, observing it once per sleep period
/// (never mid-scan), matching "sweeper threads observe a shutdown flag
/// and exit within one poll period".
pub fn spawn(
    pool: Arc<BufferPool>,
    shard_index: usize,
    epoch: Arc<RevisionEpochTracker>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(shard_index, "clock sweeper observed shutdown, exiting");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let span = tracing::info_span!("sweep", shard = shard_index);
            let _enter = span.enter();
            let min_active = epoch.min_active_revision();
            let outcome = pool.sweep_shard(shard_index, min_active);
            if outcome.evicted > 0 {
                metrics::CACHE_EVICTIONS
                    .with_label_values(&[&shard_index.to_string()])
                    .inc_by(outcome.evicted as u64);
            }
            tracing::trace!(
                scanned = outcome.scanned,
                evicted = outcome.evicted,
                "sweep pass complete"
            );
        }
    })
}
