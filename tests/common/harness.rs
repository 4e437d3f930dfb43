//! Test harness lifecycle
//!
//! Wires the queue, the rate limiter and the validator together the way a
//! host application does, over SQLite files in a temp directory. The
//! databases are removed when the harness is dropped.

use super::fakes::{FakeCatalog, FakeIndex};
use super::{POST, START_TIME, USER};
use reindex_queue::cache::{ObjectCache, SqliteObjectCache};
use reindex_queue::clock::{Clock, ManualClock};
use reindex_queue::index_queue::{
    DispatchMode, IndexQueue, IndexQueueConfig, QueueWorker, RateLimiter, RateLimiterConfig,
    SqliteJobStore,
};
use reindex_queue::validator::{
    ConsistencyValidator, ValidationLock, ValidatorRegistry, DEFAULT_LOCK_TTL_SECS,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestHarness {
    pub clock: Arc<ManualClock>,
    pub catalog: Arc<FakeCatalog>,
    pub index: Arc<FakeIndex>,
    pub queue: Arc<IndexQueue>,
    pub validator: ConsistencyValidator,
    temp_dir: TempDir,
}

impl TestHarness {
    pub fn new(dispatch_mode: DispatchMode) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let clock = Arc::new(ManualClock::new(START_TIME));
        let dyn_clock: Arc<dyn Clock> = clock.clone();

        let cache: Arc<dyn ObjectCache> = Arc::new(
            SqliteObjectCache::new(temp_dir.path().join("object_cache.db"), dyn_clock.clone())
                .expect("Failed to open object cache"),
        );
        let store = Arc::new(
            SqliteJobStore::new(temp_dir.path().join("index_queue.db"))
                .expect("Failed to open index queue"),
        );

        let catalog = Arc::new(FakeCatalog::default());
        let index = Arc::new(FakeIndex::new(catalog.clone()));

        let rate_limiter = Arc::new(RateLimiter::new(
            cache.clone(),
            dyn_clock.clone(),
            RateLimiterConfig::default(),
        ));
        let queue = Arc::new(IndexQueue::new(
            store,
            rate_limiter,
            index.clone(),
            dyn_clock.clone(),
            IndexQueueConfig {
                batch_size: 100,
                dispatch_mode,
                ..Default::default()
            },
        ));

        let mut registry = ValidatorRegistry::new();
        registry.register(catalog.source(POST));
        registry.register(catalog.source(USER));
        let lock = Arc::new(ValidationLock::new(cache, dyn_clock, DEFAULT_LOCK_TTL_SECS));
        let validator = ConsistencyValidator::new(registry, index.clone(), queue.clone(), lock);

        Self {
            clock,
            catalog,
            index,
            queue,
            validator,
            temp_dir,
        }
    }

    pub fn worker(&self) -> QueueWorker {
        QueueWorker::new(self.queue.clone(), 3600)
    }

    pub fn index_queue_db_path(&self) -> PathBuf {
        self.temp_dir.path().join("index_queue.db")
    }

    /// A second connection to the cache file, as another process would open it.
    pub fn cache_from_another_process(&self) -> SqliteObjectCache {
        SqliteObjectCache::new(self.temp_dir.path().join("object_cache.db"), self.clock.clone())
            .expect("Failed to open object cache")
    }

    /// A validation lock over a second connection to the same cache file.
    pub fn lock_from_another_process(&self) -> Arc<ValidationLock> {
        let cache = self.cache_from_another_process();
        Arc::new(ValidationLock::new(
            Arc::new(cache),
            self.clock.clone(),
            DEFAULT_LOCK_TTL_SECS,
        ))
    }

    /// Store `ids` in the catalog with hash `h<id>` and index them as-is.
    pub fn seed_consistent(&self, object_type: &str, ids: impl IntoIterator<Item = i64>) {
        self.index.create_index(object_type);
        for id in ids {
            let hash = format!("h{}", id);
            self.catalog.put(object_type, id, &hash);
            self.index.put(object_type, id, &hash);
        }
    }
}
