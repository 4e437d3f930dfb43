//! Queue job storage and persistence.
//!
//! Provides SQLite-backed storage for re-index jobs. Every state transition
//! that can race between workers is a single conditional statement.

use super::models::{JobStatus, ObjectType, QueueJob};
use super::schema::INDEX_QUEUE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Result};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Trait for queue job storage operations.
pub trait JobStore: Send + Sync {
    /// Insert a `queued` job. Returns false, without error, if the object
    /// already has a queued job.
    fn insert_queued(
        &self,
        object_id: i64,
        object_type: &ObjectType,
        start_time: Option<i64>,
    ) -> Result<bool>;

    /// Atomically claim up to `limit` due queued jobs (QUEUED → RUNNING),
    /// stamping them with `now` as claim time. A job is handed to at most one
    /// caller.
    fn claim_due(&self, limit: usize, now: i64) -> Result<Vec<QueueJob>>;

    /// Return running jobs to `queued`. Jobs whose object was re-enqueued in
    /// the meantime are dropped instead, the newer queued row covers them.
    fn release_to_queued(&self, job_ids: &[i64]) -> Result<usize>;

    /// Return every job claimed at or before `claimed_before` that is still
    /// running, with the same superseding rule as `release_to_queued`.
    fn release_stale_running(&self, claimed_before: i64) -> Result<usize>;

    /// Delete jobs by id. Returns the number of rows removed.
    fn delete_jobs(&self, job_ids: &[i64]) -> Result<usize>;

    fn count(&self, status: JobStatus, object_type: &ObjectType) -> Result<u64>;

    /// Count jobs whose start time has passed (or that have none).
    fn count_due(&self, status: JobStatus, object_type: &ObjectType, now: i64) -> Result<u64>;

    /// The queued job for an object, if there is one.
    fn find_queued(&self, object_id: i64, object_type: &ObjectType) -> Result<Option<QueueJob>>;

    /// Distinct object types currently present in the queue.
    fn object_types(&self) -> Result<Vec<ObjectType>>;

    /// Remove every job. Returns the number of rows removed.
    fn purge_all(&self) -> Result<usize>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open an existing queue database or create a new one with the current
    /// schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), INDEX_QUEUE_VERSIONED_SCHEMAS, "index queue")?;
        info!("Opened index queue database at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        use anyhow::Context;

        let conn = Connection::open_in_memory()?;
        INDEX_QUEUE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("index queue connection lock poisoned"))
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<QueueJob> {
        Ok(QueueJob {
            id: row.get("id")?,
            object_id: row.get("object_id")?,
            object_type: ObjectType::from(row.get::<_, String>("object_type")?),
            start_time: row.get("start_time")?,
            status: JobStatus::from_db_str(&row.get::<_, String>("status")?)
                .unwrap_or(JobStatus::Queued),
        })
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

impl JobStore for SqliteJobStore {
    fn insert_queued(
        &self,
        object_id: i64,
        object_type: &ObjectType,
        start_time: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO index_queue (object_id, object_type, start_time, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                object_id,
                object_type.as_str(),
                start_time,
                JobStatus::Queued.as_db_str()
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                debug!("{} {} is already queued", object_type, object_id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn claim_due(&self, limit: usize, now: i64) -> Result<Vec<QueueJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        // Selection and transition happen in one statement, so no other
        // connection can claim the same rows in between.
        let mut stmt = conn.prepare(
            "UPDATE index_queue SET status = 'running', claimed_at = ?1
             WHERE id IN (
                SELECT id FROM index_queue
                WHERE status = 'queued' AND (start_time IS NULL OR start_time <= ?1)
                ORDER BY id
                LIMIT ?2
             )
             RETURNING id, object_id, object_type, start_time, status",
        )?;
        let mut jobs = stmt
            .query_map(params![now, limit as i64], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    fn release_to_queued(&self, job_ids: &[i64]) -> Result<usize> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let placeholders = Self::placeholders(job_ids.len());
        let released = tx.execute(
            &format!(
                "UPDATE OR IGNORE index_queue SET status = 'queued', claimed_at = NULL
                 WHERE status = 'running' AND id IN ({})",
                placeholders
            ),
            params_from_iter(job_ids.iter()),
        )?;
        // Rows left running collided with a newer queued row for the same object
        tx.execute(
            &format!(
                "DELETE FROM index_queue WHERE status = 'running' AND id IN ({})",
                placeholders
            ),
            params_from_iter(job_ids.iter()),
        )?;
        tx.commit()?;
        Ok(released)
    }

    fn release_stale_running(&self, claimed_before: i64) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let released = tx.execute(
            "UPDATE OR IGNORE index_queue SET status = 'queued', claimed_at = NULL
             WHERE status = 'running' AND (claimed_at IS NULL OR claimed_at <= ?1)",
            params![claimed_before],
        )?;
        let superseded = tx.execute(
            "DELETE FROM index_queue
             WHERE status = 'running' AND (claimed_at IS NULL OR claimed_at <= ?1)",
            params![claimed_before],
        )?;
        tx.commit()?;
        if released + superseded > 0 {
            info!(
                "Recovered {} stale running jobs ({} superseded by a newer queued job)",
                released + superseded,
                superseded
            );
        }
        Ok(released)
    }

    fn delete_jobs(&self, job_ids: &[i64]) -> Result<usize> {
        if job_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let deleted = conn.execute(
            &format!(
                "DELETE FROM index_queue WHERE id IN ({})",
                Self::placeholders(job_ids.len())
            ),
            params_from_iter(job_ids.iter()),
        )?;
        Ok(deleted)
    }

    fn count(&self, status: JobStatus, object_type: &ObjectType) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM index_queue WHERE status = ?1 AND object_type = ?2",
            params![status.as_db_str(), object_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn count_due(&self, status: JobStatus, object_type: &ObjectType, now: i64) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM index_queue
             WHERE status = ?1 AND object_type = ?2
             AND (start_time IS NULL OR start_time <= ?3)",
            params![status.as_db_str(), object_type.as_str(), now],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn find_queued(&self, object_id: i64, object_type: &ObjectType) -> Result<Option<QueueJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                "SELECT id, object_id, object_type, start_time, status FROM index_queue
                 WHERE object_id = ?1 AND object_type = ?2 AND status = 'queued'
                 LIMIT 1",
                params![object_id, object_type.as_str()],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn object_types(&self) -> Result<Vec<ObjectType>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT object_type FROM index_queue ORDER BY object_type")?;
        let types = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(ObjectType::from))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(types)
    }

    fn purge_all(&self) -> Result<usize> {
        let conn = self.conn()?;
        // SQLite has no TRUNCATE; an unconditional DELETE uses the truncate
        // optimization.
        let deleted = conn.execute("DELETE FROM index_queue", [])?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use tempfile::TempDir;

    fn post() -> ObjectType {
        ObjectType::from("post")
    }

    #[test]
    fn test_insert_deduplicates_queued_rows() {
        let store = SqliteJobStore::in_memory().unwrap();

        assert!(store.insert_queued(1, &post(), None).unwrap());
        assert!(!store.insert_queued(1, &post(), Some(500)).unwrap());
        assert!(store.insert_queued(1, &ObjectType::from("user"), None).unwrap());

        assert_eq!(store.count(JobStatus::Queued, &post()).unwrap(), 1);
        let job = store.find_queued(1, &post()).unwrap().unwrap();
        assert_eq!(job.start_time, None);
    }

    #[test]
    fn test_running_row_does_not_block_new_queued_row() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert_queued(7, &post(), None).unwrap();
        let claimed = store.claim_due(10, 0).unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(store.insert_queued(7, &post(), None).unwrap());
        assert_eq!(store.count(JobStatus::Running, &post()).unwrap(), 1);
        assert_eq!(store.count(JobStatus::Queued, &post()).unwrap(), 1);
    }

    #[test]
    fn test_claim_due_respects_start_time_and_limit() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert_queued(1, &post(), None).unwrap();
        store.insert_queued(2, &post(), Some(100)).unwrap();
        store.insert_queued(3, &post(), Some(200)).unwrap();
        store.insert_queued(4, &post(), None).unwrap();

        let first = store.claim_due(1, 150).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].object_id, 1);
        assert_eq!(first[0].status, JobStatus::Running);

        let second = store.claim_due(10, 150).unwrap();
        let ids: Vec<i64> = second.iter().map(|j| j.object_id).collect();
        assert_eq!(ids, vec![2, 4]);

        assert_eq!(store.count(JobStatus::Queued, &post()).unwrap(), 1);
        assert_eq!(store.count_due(JobStatus::Queued, &post(), 150).unwrap(), 0);
        assert_eq!(store.count_due(JobStatus::Queued, &post(), 200).unwrap(), 1);
    }

    #[test]
    fn test_release_to_queued_drops_superseded_jobs() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.insert_queued(1, &post(), None).unwrap();
        store.insert_queued(2, &post(), None).unwrap();
        let claimed = store.claim_due(10, 0).unwrap();

        // Object 2 gets re-enqueued while its job is running
        store.insert_queued(2, &post(), None).unwrap();

        let ids: Vec<i64> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(store.release_to_queued(&ids).unwrap(), 1);
        assert_eq!(store.count(JobStatus::Running, &post()).unwrap(), 0);
        assert_eq!(store.count(JobStatus::Queued, &post()).unwrap(), 2);
    }

    #[test]
    fn test_release_stale_running_only_touches_old_claims() {
        let store = SqliteJobStore::in_memory().unwrap();
        for id in 1..=3 {
            store.insert_queued(id, &post(), None).unwrap();
        }
        store.claim_due(2, 100).unwrap();
        store.claim_due(1, 500).unwrap();
        // Object 1 was re-enqueued while its job was stranded
        store.insert_queued(1, &post(), None).unwrap();

        assert_eq!(store.release_stale_running(99).unwrap(), 0);
        assert_eq!(store.release_stale_running(100).unwrap(), 1);
        assert_eq!(store.count(JobStatus::Running, &post()).unwrap(), 1);
        assert_eq!(store.count(JobStatus::Queued, &post()).unwrap(), 2);

        // Released jobs are claimable again and carry the new claim time
        let reclaimed = store.claim_due(10, 600).unwrap();
        let ids: Vec<i64> = reclaimed.iter().map(|j| j.object_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(store.release_stale_running(599).unwrap(), 1);
    }

    #[test]
    fn test_version_0_database_is_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index_queue.db");
        {
            let conn = Connection::open(&path).unwrap();
            INDEX_QUEUE_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
            conn.execute(
                "INSERT INTO index_queue (object_id, object_type, status)
                 VALUES (4, 'post', 'running')",
                [],
            )
            .unwrap();
        }

        let store = SqliteJobStore::new(&path).unwrap();
        // Running rows from before the migration have no claim time
        assert_eq!(store.release_stale_running(0).unwrap(), 1);
        assert_eq!(store.claim_due(10, 50).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_and_purge() {
        let store = SqliteJobStore::in_memory().unwrap();
        for id in 1..=5 {
            store.insert_queued(id, &post(), None).unwrap();
        }
        store.insert_queued(1, &ObjectType::from("term"), None).unwrap();

        let claimed = store.claim_due(2, 0).unwrap();
        let ids: Vec<i64> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(store.delete_jobs(&ids).unwrap(), 2);
        assert_eq!(store.delete_jobs(&[]).unwrap(), 0);

        assert_eq!(
            store.object_types().unwrap(),
            vec![ObjectType::from("post"), ObjectType::from("term")]
        );
        assert_eq!(store.purge_all().unwrap(), 4);
        assert!(store.object_types().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_claims_never_share_a_job() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index_queue.db");
        {
            let store = SqliteJobStore::new(&path).unwrap();
            for id in 1..=200 {
                store.insert_queued(id, &post(), None).unwrap();
            }
        }

        // Separate connections, as separate worker processes would have
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let store = SqliteJobStore::new(&path).unwrap();
                    let mut claimed = Vec::new();
                    loop {
                        let batch = store.claim_due(7, 0).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        claimed.extend(batch.into_iter().map(|j| j.object_id));
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for object_id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(object_id), "object {} claimed twice", object_id);
            }
        }
        assert_eq!(total, 200);
    }
}
