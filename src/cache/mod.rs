//! Expiring key-value cache.
//!
//! Holds the short-lived state shared between queue workers and validator
//! runs: last-index timestamps, process-wide rate-limit windows and the
//! validation lock/abort flags. Entries are grouped by concern and carry an
//! optional expiry; an expired entry is indistinguishable from an absent one.

mod memory;
mod schema;
mod sqlite_cache;

pub use memory::InMemoryCache;
pub use schema::OBJECT_CACHE_VERSIONED_SCHEMAS;
pub use sqlite_cache::SqliteObjectCache;

use anyhow::Result;

/// Storage operations the rate limiter and the validation lock rely on.
///
/// `ttl_secs` of `None` means the entry never expires.
pub trait ObjectCache: Send + Sync {
    /// Read a live entry.
    fn get(&self, group: &str, key: &str) -> Result<Option<i64>>;

    /// Store a value, overwriting any previous one.
    fn set(&self, group: &str, key: &str, value: i64, ttl_secs: Option<i64>) -> Result<()>;

    /// Store a value only if no live entry exists.
    /// Returns true if the value was stored.
    fn add(&self, group: &str, key: &str, value: i64, ttl_secs: Option<i64>) -> Result<bool>;

    /// Remove an entry. Returns true if a live entry was removed.
    fn delete(&self, group: &str, key: &str) -> Result<bool>;

    /// Add `by` to a live entry, or start a new one at `by` with the given
    /// expiry. The expiry of an existing entry is left untouched.
    fn increment(&self, group: &str, key: &str, by: i64, ttl_secs: Option<i64>) -> Result<i64>;

    /// Drop expired entries. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

fn expires_at(now: i64, ttl_secs: Option<i64>) -> Option<i64> {
    ttl_secs.map(|ttl| now + ttl)
}
