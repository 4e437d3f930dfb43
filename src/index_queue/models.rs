//! Data models for the re-index queue.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator of a source-of-truth entity ("post", "user", "term", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectType(String);

impl ObjectType {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectType {
    fn from(slug: &str) -> Self {
        Self(slug.to_string())
    }
}

impl From<String> for ObjectType {
    fn from(slug: String) -> Self {
        Self(slug)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
}

impl JobStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// One pending or in-flight re-index request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    /// Store-assigned identifier
    pub id: i64,
    pub object_id: i64,
    pub object_type: ObjectType,
    /// Not eligible before this unix timestamp; `None` means eligible now
    pub start_time: Option<i64>,
    pub status: JobStatus,
}

/// Result of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new queued row was inserted.
    Queued { start_time: Option<i64> },
    /// The object already had a queued row; nothing changed.
    AlreadyQueued,
}

impl EnqueueOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued { .. })
    }
}

/// How a dispatch treats the backend's per-document response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Every dispatched job counts as indexed, whatever the backend said.
    /// This is the long-standing behavior and it loses per-document
    /// failures.
    #[default]
    BestEffort,
    /// Only ids the backend confirms advance rate-limit state and leave the
    /// queue; the rest go back to `queued`.
    Strict,
}

/// Summary of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Jobs handed to the backend.
    pub dispatched: usize,
    /// Jobs recorded as indexed and deleted.
    pub completed: usize,
    /// Jobs returned to the queue (strict mode only).
    pub requeued: usize,
    /// Bulk calls that returned an error.
    pub failed_calls: usize,
    /// Object type groups whose queue bookkeeping failed after the bulk
    /// call. Their jobs were returned to the queue, or are left for stale
    /// recovery if that failed too.
    pub failed_groups: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.dispatched += other.dispatched;
        self.completed += other.completed;
        self.requeued += other.requeued;
        self.failed_calls += other.failed_calls;
        self.failed_groups += other.failed_groups;
    }
}

/// Queue introspection counters for one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub object_type: ObjectType,
    pub queued: u64,
    pub queued_due: u64,
    pub running: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_db_round_trip() {
        assert_eq!(JobStatus::from_db_str("queued"), Some(JobStatus::Queued));
        assert_eq!(JobStatus::from_db_str("running"), Some(JobStatus::Running));
        assert_eq!(JobStatus::from_db_str("done"), None);
    }

    #[test]
    fn test_dispatch_mode_deserializes_from_snake_case() {
        let mode: DispatchMode = serde_json::from_str("\"strict\"").unwrap();
        assert_eq!(mode, DispatchMode::Strict);
        assert_eq!(DispatchMode::default(), DispatchMode::BestEffort);
    }
}
