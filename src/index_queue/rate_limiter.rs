//! Rate limiting for re-index scheduling.
//!
//! Two independent mechanisms live here:
//! - a per-object limiter that remembers when each object was last indexed
//!   and pushes the next re-index at least one interval later;
//! - process-wide suppression windows for querying and for indexing, set when
//!   the backend is overloaded and reported to operators.
//!
//! All state sits in the shared [`ObjectCache`]. The limiter never fails a
//! caller: a cache error is logged and treated as "not limited".

use super::models::ObjectType;
use crate::cache::ObjectCache;
use crate::clock::Clock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache group holding last-index timestamps.
pub const LAST_INDEX_CACHE_GROUP: &str = "index-queue";
/// Cache group holding the query counter and its suppression window.
pub const QUERY_RATE_LIMIT_CACHE_GROUP: &str = "search-rate-limit";
/// Cache group holding the indexing suppression window.
pub const INDEXING_RATE_LIMIT_CACHE_GROUP: &str = "indexing-rate-limit";

const QUERY_COUNT_KEY: &str = "query_count";
const QUERY_RATE_LIMIT_START_KEY: &str = "query_rate_limit_start";
const INDEXING_RATE_LIMIT_START_KEY: &str = "indexing_rate_limit_start";

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum seconds between two re-indexes of the same object
    pub default_index_interval_secs: i64,
    /// Per object type overrides of the interval
    pub per_type_interval_secs: HashMap<String, i64>,
    /// Retention of last-index records; longer than any interval
    pub last_index_ttl_secs: i64,
    /// Queries allowed per window before querying is suppressed
    pub max_query_count: i64,
    pub query_window_secs: i64,
    /// How long an indexing suppression lasts unless cleared earlier
    pub indexing_window_secs: i64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_index_interval_secs: 60,
            per_type_interval_secs: HashMap::new(),
            last_index_ttl_secs: 120,
            max_query_count: 50_000,
            query_window_secs: 60,
            indexing_window_secs: 300,
        }
    }
}

/// Kind of process-wide suppression window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    Search,
    Indexing,
}

impl RateLimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitKind::Search => "search",
            RateLimitKind::Indexing => "indexing",
        }
    }
}

/// An active suppression window, for operator reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitWindow {
    pub kind: RateLimitKind,
    pub start_time: i64,
    pub info: String,
}

pub struct RateLimiter {
    cache: Arc<dyn ObjectCache>,
    clock: Arc<dyn Clock>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn ObjectCache>, clock: Arc<dyn Clock>, config: RateLimiterConfig) -> Self {
        Self {
            cache,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Cache key of an object's last-index timestamp.
    pub fn last_index_key(object_type: &ObjectType, object_id: i64) -> String {
        format!("{}-{}", object_type, object_id)
    }

    /// Minimum seconds between re-indexes for objects of this type.
    pub fn index_interval_secs(&self, object_type: &ObjectType) -> i64 {
        self.config
            .per_type_interval_secs
            .get(object_type.as_str())
            .copied()
            .unwrap_or(self.config.default_index_interval_secs)
    }

    /// Earliest time the object may be re-indexed, or `None` if it may be
    /// indexed right away.
    pub fn next_eligible_time(&self, object_type: &ObjectType, object_id: i64) -> Option<i64> {
        self.last_index_time(object_type, object_id)
            .map(|last| last + self.index_interval_secs(object_type))
    }

    pub fn last_index_time(&self, object_type: &ObjectType, object_id: i64) -> Option<i64> {
        let key = Self::last_index_key(object_type, object_id);
        match self.cache.get(LAST_INDEX_CACHE_GROUP, &key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read last index time for {}: {}", key, e);
                None
            }
        }
    }

    /// Remember `at` as the object's last index time, replacing any earlier
    /// record.
    pub fn record_indexed(&self, object_type: &ObjectType, object_id: i64, at: i64) {
        let key = Self::last_index_key(object_type, object_id);
        if let Err(e) = self.cache.set(
            LAST_INDEX_CACHE_GROUP,
            &key,
            at,
            Some(self.config.last_index_ttl_secs),
        ) {
            warn!("Failed to record last index time for {}: {}", key, e);
        }
    }

    /// Count one backend query. Returns true if querying is suppressed after
    /// this call.
    pub fn record_query(&self) -> bool {
        let count = match self.cache.increment(
            QUERY_RATE_LIMIT_CACHE_GROUP,
            QUERY_COUNT_KEY,
            1,
            Some(self.config.query_window_secs),
        ) {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count query: {}", e);
                return false;
            }
        };

        if count > self.config.max_query_count {
            let now = self.clock.now();
            // `add` keeps the first start time of an ongoing window
            match self.cache.add(
                QUERY_RATE_LIMIT_CACHE_GROUP,
                QUERY_RATE_LIMIT_START_KEY,
                now,
                Some(self.config.query_window_secs),
            ) {
                Ok(true) => warn!(
                    "Query rate limit reached ({} of {}), suppressing queries",
                    count, self.config.max_query_count
                ),
                Ok(false) => {}
                Err(e) => warn!("Failed to start query rate limit: {}", e),
            }
        }

        self.is_query_rate_limited()
    }

    pub fn query_count(&self) -> i64 {
        self.read_or_absent(QUERY_RATE_LIMIT_CACHE_GROUP, QUERY_COUNT_KEY)
            .unwrap_or(0)
    }

    pub fn is_query_rate_limited(&self) -> bool {
        self.query_rate_limit_start().is_some()
    }

    pub fn query_rate_limit_start(&self) -> Option<i64> {
        self.read_or_absent(QUERY_RATE_LIMIT_CACHE_GROUP, QUERY_RATE_LIMIT_START_KEY)
    }

    /// Suppress all indexing for the configured window. An ongoing window
    /// keeps its original start time.
    pub fn start_indexing_rate_limit(&self) {
        let now = self.clock.now();
        match self.cache.add(
            INDEXING_RATE_LIMIT_CACHE_GROUP,
            INDEXING_RATE_LIMIT_START_KEY,
            now,
            Some(self.config.indexing_window_secs),
        ) {
            Ok(true) => info!(
                "Indexing rate limited for {}s",
                self.config.indexing_window_secs
            ),
            Ok(false) => {}
            Err(e) => warn!("Failed to start indexing rate limit: {}", e),
        }
    }

    pub fn clear_indexing_rate_limit(&self) {
        match self
            .cache
            .delete(INDEXING_RATE_LIMIT_CACHE_GROUP, INDEXING_RATE_LIMIT_START_KEY)
        {
            Ok(true) => info!("Indexing rate limit cleared"),
            Ok(false) => {}
            Err(e) => warn!("Failed to clear indexing rate limit: {}", e),
        }
    }

    pub fn is_indexing_rate_limited(&self) -> bool {
        self.indexing_rate_limit_start().is_some()
    }

    pub fn indexing_rate_limit_start(&self) -> Option<i64> {
        self.read_or_absent(INDEXING_RATE_LIMIT_CACHE_GROUP, INDEXING_RATE_LIMIT_START_KEY)
    }

    /// Suppression windows currently in effect, queries first.
    pub fn active_windows(&self) -> Vec<RateLimitWindow> {
        let mut windows = Vec::new();
        if let Some(start_time) = self.query_rate_limit_start() {
            windows.push(RateLimitWindow {
                kind: RateLimitKind::Search,
                start_time,
                info: format!("({} of {})", self.query_count(), self.config.max_query_count),
            });
        }
        if let Some(start_time) = self.indexing_rate_limit_start() {
            windows.push(RateLimitWindow {
                kind: RateLimitKind::Indexing,
                start_time,
                info: "n/a".to_string(),
            });
        }
        windows
    }

    /// Drop expired last-index records and rate-limit windows from the
    /// cache. Returns how many entries were removed.
    pub fn purge_expired_cache(&self) -> usize {
        match self.cache.purge_expired() {
            Ok(removed) => {
                if removed > 0 {
                    debug!("Purged {} expired cache entries", removed);
                }
                removed
            }
            Err(e) => {
                warn!("Failed to purge expired cache entries: {}", e);
                0
            }
        }
    }

    fn read_or_absent(&self, group: &str, key: &str) -> Option<i64> {
        self.cache.get(group, key).unwrap_or_else(|e| {
            warn!("Failed to read {}/{}: {}", group, key, e);
            None
        })
    }
}
