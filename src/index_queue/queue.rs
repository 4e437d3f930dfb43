//! The re-index queue.
//!
//! Enqueue requests are deduplicated and pushed past the object's rate-limit
//! interval. Workers pull due jobs in batches, which are grouped by object
//! type and handed to the index client in one bulk call per type.

use super::job_store::JobStore;
use super::models::{
    DispatchMode, DispatchReport, EnqueueOutcome, JobStatus, ObjectType, QueueCounts, QueueJob,
};
use super::rate_limiter::RateLimiter;
use crate::clock::Clock;
use crate::index_client::IndexClient;
use crate::metrics;
use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Configuration for the index queue.
#[derive(Debug, Clone)]
pub struct IndexQueueConfig {
    /// Jobs claimed per processing cycle
    pub batch_size: usize,
    pub dispatch_mode: DispatchMode,
    /// Running jobs claimed longer ago than this are returned to the queue
    pub stale_running_secs: i64,
}

impl Default for IndexQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            dispatch_mode: DispatchMode::BestEffort,
            stale_running_secs: 600,
        }
    }
}

pub struct IndexQueue {
    store: Arc<dyn JobStore>,
    rate_limiter: Arc<RateLimiter>,
    index_client: Arc<dyn IndexClient>,
    clock: Arc<dyn Clock>,
    config: IndexQueueConfig,
}

impl IndexQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        rate_limiter: Arc<RateLimiter>,
        index_client: Arc<dyn IndexClient>,
        clock: Arc<dyn Clock>,
        config: IndexQueueConfig,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            index_client,
            clock,
            config,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn config(&self) -> &IndexQueueConfig {
        &self.config
    }

    /// Queue an object for re-indexing.
    ///
    /// If the object was indexed recently the job is scheduled for the end of
    /// its rate-limit interval. Enqueuing an object that is already queued
    /// changes nothing.
    pub fn enqueue(&self, object_id: i64, object_type: &ObjectType) -> Result<EnqueueOutcome> {
        let start_time = self.rate_limiter.next_eligible_time(object_type, object_id);

        let outcome = if self.store.insert_queued(object_id, object_type, start_time)? {
            debug!(
                "Queued {} {} (start_time={:?})",
                object_type, object_id, start_time
            );
            metrics::record_enqueue(object_type.as_str(), "queued");
            EnqueueOutcome::Queued { start_time }
        } else {
            metrics::record_enqueue(object_type.as_str(), "already_queued");
            EnqueueOutcome::AlreadyQueued
        };
        Ok(outcome)
    }

    /// Queue every object of a synchronous indexing batch instead of indexing
    /// it inline. Returns how many new jobs were created.
    pub fn enqueue_many(&self, object_ids: &[i64], object_type: &ObjectType) -> Result<usize> {
        let mut queued = 0;
        for &object_id in object_ids {
            if self.enqueue(object_id, object_type)?.is_new() {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(
                "Offloaded {} of {} {} objects to the index queue",
                queued,
                object_ids.len(),
                object_type
            );
        }
        Ok(queued)
    }

    /// The pending job for an object, if it has one.
    pub fn next_job_for_object(
        &self,
        object_id: i64,
        object_type: &ObjectType,
    ) -> Result<Option<QueueJob>> {
        self.store.find_queued(object_id, object_type)
    }

    /// Claim up to `limit` due jobs. Claimed jobs are `running` and belong to
    /// the caller until dispatched.
    pub fn pull_due_batch(&self, limit: usize) -> Result<Vec<QueueJob>> {
        let jobs = self.store.claim_due(limit, self.clock.now())?;
        if !jobs.is_empty() {
            debug!("Claimed {} due jobs", jobs.len());
            metrics::record_batch_size(jobs.len());
        }
        Ok(jobs)
    }

    /// Send claimed jobs to the index backend, one bulk call per object type.
    ///
    /// In best-effort mode every job counts as indexed once its bulk call
    /// returns, even if the call failed or reported failed documents; this
    /// loses per-document failures. In strict mode only confirmed objects are
    /// recorded and removed, the rest are returned to the queue.
    ///
    /// A queue store failure in one group does not stop the others. The
    /// group's jobs are returned to the queue and counted in
    /// `failed_groups`.
    pub fn dispatch(&self, jobs: &[QueueJob]) -> Result<DispatchReport> {
        let mut groups: BTreeMap<&ObjectType, Vec<&QueueJob>> = BTreeMap::new();
        for job in jobs {
            groups.entry(&job.object_type).or_default().push(job);
        }

        let mut report = DispatchReport::default();
        for (object_type, group) in groups {
            match self.dispatch_group(object_type, &group) {
                Ok(group_report) => report.merge(group_report),
                Err(e) => {
                    error!(
                        "Failed to settle {} {} jobs: {:#}",
                        group.len(),
                        object_type,
                        e
                    );
                    self.release_group(object_type, &group);
                    metrics::record_dispatch(object_type.as_str(), "released", group.len());
                    report.dispatched += group.len();
                    report.failed_groups += 1;
                }
            }
        }
        Ok(report)
    }

    fn release_group(&self, object_type: &ObjectType, jobs: &[&QueueJob]) {
        let job_ids: Vec<i64> = jobs.iter().map(|job| job.id).collect();
        match self.store.release_to_queued(&job_ids) {
            Ok(released) => info!(
                "Returned {} {} jobs to the queue after a failed dispatch",
                released, object_type
            ),
            Err(e) => warn!(
                "Failed to return {} {} jobs to the queue, leaving them for stale recovery: {:#}",
                job_ids.len(),
                object_type,
                e
            ),
        }
    }

    fn dispatch_group(&self, object_type: &ObjectType, jobs: &[&QueueJob]) -> Result<DispatchReport> {
        let object_ids: Vec<i64> = jobs.iter().map(|job| job.object_id).collect();
        let mut report = DispatchReport {
            dispatched: jobs.len(),
            ..Default::default()
        };

        let result = self.index_client.bulk_index(object_type, &object_ids);
        let failed_ids: HashSet<i64> = match &result {
            Ok(outcome) => outcome.failed_ids.iter().copied().collect(),
            Err(e) => {
                warn!(
                    "Bulk index of {} {} objects failed: {}",
                    object_ids.len(),
                    object_type,
                    e
                );
                report.failed_calls = 1;
                object_ids.iter().copied().collect()
            }
        };

        let (confirmed, unconfirmed): (Vec<&QueueJob>, Vec<&QueueJob>) = match self.config.dispatch_mode {
            DispatchMode::BestEffort => {
                if !failed_ids.is_empty() {
                    warn!(
                        "{} {} objects not confirmed by the backend, marking them indexed anyway",
                        failed_ids.len(),
                        object_type
                    );
                }
                (jobs.to_vec(), Vec::new())
            }
            DispatchMode::Strict => jobs
                .iter()
                .copied()
                .partition(|job| !failed_ids.contains(&job.object_id)),
        };

        let now = self.clock.now();
        for job in &confirmed {
            self.rate_limiter
                .record_indexed(object_type, job.object_id, now);
        }
        let confirmed_ids: Vec<i64> = confirmed.iter().map(|job| job.id).collect();
        report.completed = self.store.delete_jobs(&confirmed_ids)?;

        if !unconfirmed.is_empty() {
            let unconfirmed_ids: Vec<i64> = unconfirmed.iter().map(|job| job.id).collect();
            self.store.release_to_queued(&unconfirmed_ids)?;
            report.requeued = unconfirmed.len();
            info!(
                "Returned {} unconfirmed {} jobs to the queue",
                unconfirmed.len(),
                object_type
            );
        }

        metrics::record_dispatch(object_type.as_str(), "completed", report.completed);
        metrics::record_dispatch(object_type.as_str(), "requeued", report.requeued);
        debug!(
            "Dispatched {} {} jobs ({} completed, {} requeued)",
            report.dispatched, object_type, report.completed, report.requeued
        );
        Ok(report)
    }

    /// Return jobs that have been running for longer than
    /// `stale_running_secs` to the queue. Such jobs belong to a dispatch that
    /// crashed or could not settle its bookkeeping.
    pub fn recover_stale_running(&self) -> Result<usize> {
        let claimed_before = self.clock.now() - self.config.stale_running_secs;
        self.store.release_stale_running(claimed_before)
    }

    /// Recover stale jobs, then pull one batch of the configured size and
    /// dispatch it.
    pub fn process_next_batch(&self) -> Result<DispatchReport> {
        if let Err(e) = self.recover_stale_running() {
            warn!("Failed to recover stale running jobs: {:#}", e);
        }
        let jobs = self.pull_due_batch(self.config.batch_size)?;
        if jobs.is_empty() {
            return Ok(DispatchReport::default());
        }
        self.dispatch(&jobs)
    }

    pub fn count(&self, status: JobStatus, object_type: &ObjectType) -> Result<u64> {
        self.store.count(status, object_type)
    }

    pub fn count_due(&self, status: JobStatus, object_type: &ObjectType) -> Result<u64> {
        self.store.count_due(status, object_type, self.clock.now())
    }

    /// Counters for every object type present in the queue.
    pub fn counts(&self) -> Result<Vec<QueueCounts>> {
        queue_counts(self.store.as_ref(), self.clock.now())
    }

    /// Remove every job, queued or running.
    pub fn purge_all(&self) -> Result<usize> {
        let purged = self.store.purge_all()?;
        info!("Purged {} jobs from the index queue", purged);
        Ok(purged)
    }
}

/// Counters for every object type present in `store`.
///
/// Free function so operator tooling can report on a queue database without
/// an index client.
pub fn queue_counts(store: &dyn JobStore, now: i64) -> Result<Vec<QueueCounts>> {
    store
        .object_types()?
        .into_iter()
        .map(|object_type| {
            Ok(QueueCounts {
                queued: store.count(JobStatus::Queued, &object_type)?,
                queued_due: store.count_due(JobStatus::Queued, &object_type, now)?,
                running: store.count(JobStatus::Running, &object_type)?,
                object_type,
            })
        })
        .collect()
}
