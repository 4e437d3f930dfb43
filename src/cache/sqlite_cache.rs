//! SQLite-backed cache, shared by every process that opens the same file.

use super::schema::OBJECT_CACHE_VERSIONED_SCHEMAS;
use super::{expires_at, ObjectCache};
use crate::clock::Clock;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct SqliteObjectCache {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteObjectCache {
    pub fn new<P: AsRef<Path>>(db_path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), OBJECT_CACHE_VERSIONED_SCHEMAS, "object cache")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    /// Create an in-memory cache for testing.
    #[cfg(test)]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        OBJECT_CACHE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("object cache connection lock poisoned"))
    }
}

impl ObjectCache for SqliteObjectCache {
    fn get(&self, group: &str, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now();
        let value = self
            .conn()?
            .query_row(
                "SELECT value FROM object_cache
                 WHERE cache_group = ?1 AND cache_key = ?2
                 AND (expires_at IS NULL OR expires_at > ?3)",
                params![group, key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, group: &str, key: &str, value: i64, ttl_secs: Option<i64>) -> Result<()> {
        let now = self.clock.now();
        self.conn()?.execute(
            "INSERT INTO object_cache (cache_group, cache_key, value, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_group, cache_key)
             DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![group, key, value, expires_at(now, ttl_secs)],
        )?;
        Ok(())
    }

    fn add(&self, group: &str, key: &str, value: i64, ttl_secs: Option<i64>) -> Result<bool> {
        let now = self.clock.now();
        // Only an expired row may be replaced; a live one makes this a no-op.
        let changed = self.conn()?.execute(
            "INSERT INTO object_cache (cache_group, cache_key, value, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cache_group, cache_key)
             DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
             WHERE object_cache.expires_at IS NOT NULL AND object_cache.expires_at <= ?5",
            params![group, key, value, expires_at(now, ttl_secs), now],
        )?;
        Ok(changed == 1)
    }

    fn delete(&self, group: &str, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM object_cache
             WHERE cache_group = ?1 AND cache_key = ?2
             AND (expires_at IS NULL OR expires_at > ?3)",
            params![group, key, now],
        )?;
        conn.execute(
            "DELETE FROM object_cache WHERE cache_group = ?1 AND cache_key = ?2",
            params![group, key],
        )?;
        Ok(deleted > 0)
    }

    fn increment(&self, group: &str, key: &str, by: i64, ttl_secs: Option<i64>) -> Result<i64> {
        let now = self.clock.now();
        let value = self
            .conn()?
            .query_row(
                "INSERT INTO object_cache (cache_group, cache_key, value, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cache_group, cache_key) DO UPDATE SET
                    value = CASE
                        WHEN object_cache.expires_at IS NOT NULL AND object_cache.expires_at <= ?5
                        THEN excluded.value
                        ELSE object_cache.value + excluded.value
                    END,
                    expires_at = CASE
                        WHEN object_cache.expires_at IS NOT NULL AND object_cache.expires_at <= ?5
                        THEN excluded.expires_at
                        ELSE object_cache.expires_at
                    END
                 RETURNING value",
                params![group, key, by, expires_at(now, ttl_secs), now],
                |row| row.get(0),
            )
            .context("Failed to increment cache counter")?;
        Ok(value)
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.conn()?.execute(
            "DELETE FROM object_cache WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn cache_at(start: i64) -> (SqliteObjectCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (SqliteObjectCache::in_memory(clock.clone()).unwrap(), clock)
    }

    #[test]
    fn test_set_overwrites_and_expires() {
        let (cache, clock) = cache_at(1_000);
        cache.set("g", "k", 1, Some(120)).unwrap();
        cache.set("g", "k", 2, Some(120)).unwrap();
        assert_eq!(cache.get("g", "k").unwrap(), Some(2));

        clock.advance(120);
        assert_eq!(cache.get("g", "k").unwrap(), None);
    }

    #[test]
    fn test_add_replaces_only_expired_rows() {
        let (cache, clock) = cache_at(0);
        assert!(cache.add("lock", "validate", 1, Some(30)).unwrap());
        assert!(!cache.add("lock", "validate", 1, Some(30)).unwrap());

        clock.advance(30);
        assert!(cache.add("lock", "validate", 7, Some(30)).unwrap());
        assert_eq!(cache.get("lock", "validate").unwrap(), Some(7));
    }

    #[test]
    fn test_add_never_replaces_permanent_row() {
        let (cache, clock) = cache_at(0);
        cache.set("g", "k", 1, None).unwrap();
        clock.advance(1_000_000);
        assert!(!cache.add("g", "k", 2, Some(1)).unwrap());
    }

    #[test]
    fn test_increment_restarts_after_expiry() {
        let (cache, clock) = cache_at(0);
        assert_eq!(cache.increment("q", "count", 1, Some(60)).unwrap(), 1);
        assert_eq!(cache.increment("q", "count", 4, Some(60)).unwrap(), 5);
        clock.advance(60);
        assert_eq!(cache.increment("q", "count", 1, Some(60)).unwrap(), 1);
    }

    #[test]
    fn test_delete_reports_live_rows_only() {
        let (cache, clock) = cache_at(0);
        cache.set("g", "live", 1, None).unwrap();
        cache.set("g", "stale", 1, Some(1)).unwrap();
        clock.advance(2);

        assert!(cache.delete("g", "live").unwrap());
        assert!(!cache.delete("g", "stale").unwrap());
        assert_eq!(cache.purge_expired().unwrap(), 0);
    }

    #[test]
    fn test_state_is_shared_through_the_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("object_cache.db");
        let clock = Arc::new(ManualClock::new(0));

        let first = SqliteObjectCache::new(&path, clock.clone()).unwrap();
        first.set("g", "k", 9, None).unwrap();

        let second = SqliteObjectCache::new(&path, clock).unwrap();
        assert_eq!(second.get("g", "k").unwrap(), Some(9));
    }
}
