//! Background processor for the index queue.
//!
//! Periodically pulls a batch of due jobs and dispatches it. Store and
//! backend calls are blocking, so each cycle runs on the blocking pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::models::DispatchReport;
use super::IndexQueue;

/// Cycles between two purges of expired cache entries.
pub const DEFAULT_CACHE_PURGE_EVERY_CYCLES: u64 = 60;

/// Background worker that drains the index queue.
///
/// Runs in a loop:
/// 1. Every few cycles, purge expired entries from the shared cache
/// 2. Skip the cycle if indexing is rate limited
/// 3. Claim one batch of due jobs and dispatch it
/// 4. Sleep for the process interval, or stop on shutdown
pub struct QueueWorker {
    queue: Arc<IndexQueue>,
    process_interval: Duration,
    cache_purge_every: u64,
    cycles: AtomicU64,
}

impl QueueWorker {
    pub fn new(queue: Arc<IndexQueue>, process_interval_secs: u64) -> Self {
        Self {
            queue,
            process_interval: Duration::from_secs(process_interval_secs),
            cache_purge_every: DEFAULT_CACHE_PURGE_EVERY_CYCLES,
            cycles: AtomicU64::new(0),
        }
    }

    /// Purge the cache every `cycles` cycles, starting with the first one.
    /// 0 disables purging.
    pub fn with_cache_purge_every(mut self, cycles: u64) -> Self {
        self.cache_purge_every = cycles;
        self
    }

    /// Main processing loop - call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Index queue worker starting (interval={}s, batch_size={})",
            self.process_interval.as_secs(),
            self.queue.config().batch_size
        );

        loop {
            tokio::select! {
                _ = self.run_cycle() => {}
                _ = shutdown.cancelled() => {
                    info!("Index queue worker shutting down");
                    break;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.process_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Index queue worker shutting down during wait");
                    break;
                }
            }
        }

        info!("Index queue worker stopped");
    }

    /// Run a single processing cycle. Returns `None` if the cycle was skipped
    /// or failed.
    pub async fn run_cycle(&self) -> Option<DispatchReport> {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        if self.cache_purge_every > 0 && cycle % self.cache_purge_every == 0 {
            self.purge_expired_cache().await;
        }

        if self.queue.rate_limiter().is_indexing_rate_limited() {
            debug!("Indexing is rate limited, skipping queue cycle");
            return None;
        }

        let queue = self.queue.clone();
        match tokio::task::spawn_blocking(move || queue.process_next_batch()).await {
            Ok(Ok(report)) => {
                if report.dispatched > 0 {
                    debug!(
                        "Queue cycle dispatched {} jobs ({} completed, {} requeued, {} groups failed)",
                        report.dispatched, report.completed, report.requeued, report.failed_groups
                    );
                }
                Some(report)
            }
            Ok(Err(e)) => {
                error!("Queue cycle failed: {}", e);
                None
            }
            Err(e) => {
                error!("Queue cycle task panicked: {}", e);
                None
            }
        }
    }

    async fn purge_expired_cache(&self) {
        let queue = self.queue.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || queue.rate_limiter().purge_expired_cache()).await
        {
            error!("Cache purge task panicked: {}", e);
        }
    }
}
