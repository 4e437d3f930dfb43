use super::{expires_at, ObjectCache};
use crate::clock::Clock;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<i64>,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local cache. State does not survive restarts and is not shared
/// with other processes.
pub struct InMemoryCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<(String, String), Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("in-memory cache lock poisoned"))
    }

    fn live_entry(
        entries: &HashMap<(String, String), Entry>,
        group: &str,
        key: &str,
        now: i64,
    ) -> Option<Entry> {
        entries
            .get(&(group.to_string(), key.to_string()))
            .filter(|entry| entry.is_live(now))
            .copied()
    }
}

impl ObjectCache for InMemoryCache {
    fn get(&self, group: &str, key: &str) -> Result<Option<i64>> {
        let now = self.clock.now();
        let entries = self.entries()?;
        Ok(Self::live_entry(&entries, group, key, now).map(|e| e.value))
    }

    fn set(&self, group: &str, key: &str, value: i64, ttl_secs: Option<i64>) -> Result<()> {
        let now = self.clock.now();
        self.entries()?.insert(
            (group.to_string(), key.to_string()),
            Entry {
                value,
                expires_at: expires_at(now, ttl_secs),
            },
        );
        Ok(())
    }

    fn add(&self, group: &str, key: &str, value: i64, ttl_secs: Option<i64>) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        if Self::live_entry(&entries, group, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            (group.to_string(), key.to_string()),
            Entry {
                value,
                expires_at: expires_at(now, ttl_secs),
            },
        );
        Ok(true)
    }

    fn delete(&self, group: &str, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let removed = self
            .entries()?
            .remove(&(group.to_string(), key.to_string()));
        Ok(removed.is_some_and(|entry| entry.is_live(now)))
    }

    fn increment(&self, group: &str, key: &str, by: i64, ttl_secs: Option<i64>) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        let entry = match Self::live_entry(&entries, group, key, now) {
            Some(existing) => Entry {
                value: existing.value + by,
                expires_at: existing.expires_at,
            },
            None => Entry {
                value: by,
                expires_at: expires_at(now, ttl_secs),
            },
        };
        entries.insert((group.to_string(), key.to_string()), entry);
        Ok(entry.value)
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}
