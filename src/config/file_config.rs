use crate::index_queue::DispatchMode;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,

    // Feature configs
    pub queue: Option<QueueConfig>,
    pub validation: Option<ValidationConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: Option<usize>,
    pub default_index_interval_secs: Option<i64>,
    pub last_index_ttl_secs: Option<i64>,
    /// Object type slug to minimum re-index interval
    pub per_type_interval_secs: Option<HashMap<String, i64>>,
    pub dispatch_mode: Option<DispatchMode>,
    pub process_interval_secs: Option<u64>,
    /// Seconds after which a claimed job that is still running is requeued
    pub stale_running_secs: Option<i64>,
    pub cache_purge_every_cycles: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ValidationConfig {
    pub batch_size: Option<i64>,
    pub max_diff_size: Option<usize>,
    pub lock_ttl_secs: Option<i64>,
    pub start_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_query_count: Option<i64>,
    pub query_window_secs: Option<i64>,
    pub indexing_window_secs: Option<i64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
