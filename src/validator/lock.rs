//! Process-wide lock and abort flag for content validation runs.
//!
//! Both live in the shared [`ObjectCache`] with a TTL, so a crashed run
//! stops holding the lock once its entry expires.

use super::error::ValidationError;
use crate::cache::ObjectCache;
use crate::clock::Clock;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const VALIDATION_CACHE_GROUP: &str = "validate-contents";
const LOCK_KEY: &str = "lock";
const ABORT_KEY: &str = "abort";

pub const DEFAULT_LOCK_TTL_SECS: i64 = 900;

pub struct ValidationLock {
    cache: Arc<dyn ObjectCache>,
    clock: Arc<dyn Clock>,
    ttl_secs: i64,
}

impl ValidationLock {
    pub fn new(cache: Arc<dyn ObjectCache>, clock: Arc<dyn Clock>, ttl_secs: i64) -> Self {
        Self {
            cache,
            clock,
            ttl_secs,
        }
    }

    /// Take the lock for a new run.
    ///
    /// Fails with `AlreadyRunning` if another run holds it, unless `force` is
    /// set. A forced run alongside a lock holder does not own the lock and
    /// leaves it alone.
    pub fn acquire(&self, force: bool) -> Result<ValidationLockGuard<'_>, ValidationError> {
        let now = self.clock.now();
        let acquired = self
            .cache
            .add(VALIDATION_CACHE_GROUP, LOCK_KEY, now, Some(self.ttl_secs))?;

        if !acquired {
            if !force {
                return Err(ValidationError::AlreadyRunning);
            }
            warn!("Content validation lock is held, running in parallel as requested");
            return Ok(ValidationLockGuard {
                lock: self,
                started_at: now,
                owned: false,
            });
        }

        // A stale request from an earlier run must not stop this one
        self.cache.delete(VALIDATION_CACHE_GROUP, ABORT_KEY)?;
        debug!("Acquired content validation lock (ttl={}s)", self.ttl_secs);
        Ok(ValidationLockGuard {
            lock: self,
            started_at: now,
            owned: true,
        })
    }

    pub fn is_ongoing(&self) -> bool {
        self.started_at().is_some()
    }

    /// Start time of the run holding the lock.
    pub fn started_at(&self) -> Option<i64> {
        self.cache
            .get(VALIDATION_CACHE_GROUP, LOCK_KEY)
            .unwrap_or_else(|e| {
                warn!("Failed to read content validation lock: {}", e);
                None
            })
    }

    /// Ask the running validation to stop after its current batch.
    pub fn request_abort(&self) -> Result<(), ValidationError> {
        if !self.is_ongoing() {
            return Err(ValidationError::NotRunning);
        }
        let now = self.clock.now();
        let stored = self
            .cache
            .add(VALIDATION_CACHE_GROUP, ABORT_KEY, now, Some(self.ttl_secs))?;
        if !stored {
            return Err(ValidationError::AbortAlreadyRequested);
        }
        info!("Requested abort of the running content validation");
        Ok(())
    }

    pub fn is_abort_requested(&self) -> bool {
        match self.cache.get(VALIDATION_CACHE_GROUP, ABORT_KEY) {
            Ok(value) => value.is_some(),
            Err(e) => {
                warn!("Failed to read content validation abort flag: {}", e);
                false
            }
        }
    }

    /// Push the expiry of the lock taken at `started_at`. An expired lock is
    /// taken back if nobody else got it in the meantime. Returns false once
    /// another run holds the lock.
    fn refresh(&self, started_at: i64) -> bool {
        let stored = match self.cache.get(VALIDATION_CACHE_GROUP, LOCK_KEY) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to refresh content validation lock: {}", e);
                return true;
            }
        };

        let result = match stored {
            Some(holder) if holder == started_at => {
                self.cache
                    .set(VALIDATION_CACHE_GROUP, LOCK_KEY, started_at, Some(self.ttl_secs))
                    .map(|_| true)
            }
            Some(holder) => {
                warn!(
                    "Content validation lock was taken over by the run started at {}",
                    holder
                );
                Ok(false)
            }
            None => {
                debug!("Content validation lock expired, taking it back");
                self.cache
                    .add(VALIDATION_CACHE_GROUP, LOCK_KEY, started_at, Some(self.ttl_secs))
            }
        };
        result.unwrap_or_else(|e| {
            warn!("Failed to refresh content validation lock: {}", e);
            true
        })
    }

    /// Drop the lock and the abort flag, unless another run took the lock
    /// over after ours expired.
    fn release(&self, started_at: i64) {
        match self.cache.get(VALIDATION_CACHE_GROUP, LOCK_KEY) {
            Ok(Some(holder)) if holder != started_at => {
                debug!(
                    "Content validation lock is held by the run started at {}, leaving it",
                    holder
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read content validation lock: {}", e);
                return;
            }
        }

        for key in [LOCK_KEY, ABORT_KEY] {
            if let Err(e) = self.cache.delete(VALIDATION_CACHE_GROUP, key) {
                warn!("Failed to release content validation {}: {}", key, e);
            }
        }
        debug!("Released content validation lock");
    }
}

/// Held for the duration of a run. Dropping it releases the lock on every
/// exit path.
///
/// The lock value is the start time of the run, which identifies the holder.
pub struct ValidationLockGuard<'a> {
    lock: &'a ValidationLock,
    started_at: i64,
    owned: bool,
}

impl ValidationLockGuard<'_> {
    /// Whether this run owns the lock, as opposed to running forced alongside
    /// another holder.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Extend the lock TTL from now. Returns false if the lock expired and
    /// another run took it, after which this guard leaves it alone.
    pub fn refresh(&mut self) -> bool {
        if self.owned && !self.lock.refresh(self.started_at) {
            self.owned = false;
        }
        self.owned
    }
}

impl Drop for ValidationLockGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.lock.release(self.started_at);
        }
    }
}
