//! Asynchronous re-index queue.
//!
//! Objects that changed in the store are queued here instead of being indexed
//! inline. A worker drains due jobs in batches, and a per-object rate limiter
//! keeps any single object from being re-indexed more than once per interval.

mod job_store;
mod models;
mod queue;
mod rate_limiter;
mod schema;
mod worker;

pub use job_store::{JobStore, SqliteJobStore};
pub use models::{
    DispatchMode, DispatchReport, EnqueueOutcome, JobStatus, ObjectType, QueueCounts, QueueJob,
};
pub use queue::{queue_counts, IndexQueue, IndexQueueConfig};
pub use rate_limiter::{
    RateLimitKind, RateLimitWindow, RateLimiter, RateLimiterConfig, LAST_INDEX_CACHE_GROUP,
};
pub use schema::INDEX_QUEUE_VERSIONED_SCHEMAS;
pub use worker::QueueWorker;
