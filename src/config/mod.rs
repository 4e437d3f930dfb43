mod file_config;

pub use file_config::{FileConfig, QueueConfig, RateLimitConfig, ValidationConfig};

use crate::index_queue::{DispatchMode, IndexQueue, IndexQueueConfig, QueueWorker, RateLimiterConfig};
use crate::validator::ValidationOptions;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub dispatch_mode: Option<DispatchMode>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,

    // Feature configs (with defaults)
    pub queue: QueueSettings,
    pub validation: ValidationSettings,
    pub rate_limit: RateLimitSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let queue_file = file.queue.unwrap_or_default();
        let defaults = QueueSettings::default();
        let queue = QueueSettings {
            batch_size: queue_file
                .batch_size
                .or(cli.batch_size)
                .unwrap_or(defaults.batch_size),
            default_index_interval_secs: queue_file
                .default_index_interval_secs
                .unwrap_or(defaults.default_index_interval_secs),
            last_index_ttl_secs: queue_file
                .last_index_ttl_secs
                .unwrap_or(defaults.last_index_ttl_secs),
            per_type_interval_secs: queue_file.per_type_interval_secs.unwrap_or_default(),
            dispatch_mode: queue_file
                .dispatch_mode
                .or(cli.dispatch_mode)
                .unwrap_or(defaults.dispatch_mode),
            process_interval_secs: queue_file
                .process_interval_secs
                .unwrap_or(defaults.process_interval_secs),
            stale_running_secs: queue_file
                .stale_running_secs
                .unwrap_or(defaults.stale_running_secs),
            cache_purge_every_cycles: queue_file
                .cache_purge_every_cycles
                .unwrap_or(defaults.cache_purge_every_cycles),
        };
        if queue.batch_size == 0 {
            bail!("queue.batch_size must be positive");
        }
        if queue.stale_running_secs <= 0 {
            bail!("queue.stale_running_secs must be positive");
        }
        // A record that expires before the interval ends would let the object
        // be re-indexed early
        if let Some((object_type, interval)) = queue
            .intervals()
            .find(|(_, interval)| *interval >= queue.last_index_ttl_secs)
        {
            bail!(
                "queue.last_index_ttl_secs ({}) must exceed the index interval of {} ({})",
                queue.last_index_ttl_secs,
                object_type,
                interval
            );
        }

        let validation_file = file.validation.unwrap_or_default();
        let defaults = ValidationSettings::default();
        let validation = ValidationSettings {
            batch_size: validation_file.batch_size.unwrap_or(defaults.batch_size),
            max_diff_size: validation_file
                .max_diff_size
                .unwrap_or(defaults.max_diff_size),
            lock_ttl_secs: validation_file
                .lock_ttl_secs
                .unwrap_or(defaults.lock_ttl_secs),
            start_id: validation_file.start_id.unwrap_or(defaults.start_id),
        };
        if validation.batch_size <= 0 {
            bail!("validation.batch_size must be positive");
        }

        let rate_limit_file = file.rate_limit.unwrap_or_default();
        let defaults = RateLimitSettings::default();
        let rate_limit = RateLimitSettings {
            max_query_count: rate_limit_file
                .max_query_count
                .unwrap_or(defaults.max_query_count),
            query_window_secs: rate_limit_file
                .query_window_secs
                .unwrap_or(defaults.query_window_secs),
            indexing_window_secs: rate_limit_file
                .indexing_window_secs
                .unwrap_or(defaults.indexing_window_secs),
        };

        Ok(Self {
            db_dir,
            queue,
            validation,
            rate_limit,
        })
    }

    pub fn index_queue_db_path(&self) -> PathBuf {
        self.db_dir.join("index_queue.db")
    }

    pub fn object_cache_db_path(&self) -> PathBuf {
        self.db_dir.join("object_cache.db")
    }

    pub fn index_queue_config(&self) -> IndexQueueConfig {
        IndexQueueConfig {
            batch_size: self.queue.batch_size,
            dispatch_mode: self.queue.dispatch_mode,
            stale_running_secs: self.queue.stale_running_secs,
        }
    }

    /// A worker draining `queue` at the configured cadence.
    pub fn queue_worker(&self, queue: Arc<IndexQueue>) -> QueueWorker {
        QueueWorker::new(queue, self.queue.process_interval_secs)
            .with_cache_purge_every(self.queue.cache_purge_every_cycles)
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            default_index_interval_secs: self.queue.default_index_interval_secs,
            per_type_interval_secs: self.queue.per_type_interval_secs.clone(),
            last_index_ttl_secs: self.queue.last_index_ttl_secs,
            max_query_count: self.rate_limit.max_query_count,
            query_window_secs: self.rate_limit.query_window_secs,
            indexing_window_secs: self.rate_limit.indexing_window_secs,
        }
    }

    /// Validation options seeded from the configured defaults.
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            start_id: self.validation.start_id,
            batch_size: self.validation.batch_size,
            max_diff_size: self.validation.max_diff_size,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub batch_size: usize,
    pub default_index_interval_secs: i64,
    pub last_index_ttl_secs: i64,
    pub per_type_interval_secs: HashMap<String, i64>,
    pub dispatch_mode: DispatchMode,
    pub process_interval_secs: u64,
    pub stale_running_secs: i64,
    /// Worker cycles between expired cache purges, 0 disables purging
    pub cache_purge_every_cycles: u64,
}

impl QueueSettings {
    fn intervals(&self) -> impl Iterator<Item = (&str, i64)> {
        std::iter::once(("the default", self.default_index_interval_secs)).chain(
            self.per_type_interval_secs
                .iter()
                .map(|(object_type, interval)| (object_type.as_str(), *interval)),
        )
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_size: 250,
            default_index_interval_secs: 60,
            last_index_ttl_secs: 120,
            per_type_interval_secs: HashMap::new(),
            dispatch_mode: DispatchMode::BestEffort,
            process_interval_secs: 5,
            stale_running_secs: 600,
            cache_purge_every_cycles: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationSettings {
    pub batch_size: i64,
    pub max_diff_size: usize,
    pub lock_ttl_secs: i64,
    pub start_id: i64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_diff_size: 1000,
            lock_ttl_secs: 900,
            start_id: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_query_count: i64,
    pub query_window_secs: i64,
    pub indexing_window_secs: i64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_query_count: 50_000,
            query_window_secs: 60,
            indexing_window_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn cli_for(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let temp_dir = make_temp_db_dir();
        let config = AppConfig::resolve(&cli_for(&temp_dir), None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.queue.batch_size, 250);
        assert_eq!(config.queue.default_index_interval_secs, 60);
        assert_eq!(config.queue.last_index_ttl_secs, 120);
        assert_eq!(config.queue.dispatch_mode, DispatchMode::BestEffort);
        assert_eq!(config.queue.process_interval_secs, 5);
        assert_eq!(config.queue.stale_running_secs, 600);
        assert_eq!(config.queue.cache_purge_every_cycles, 60);
        assert_eq!(config.validation.batch_size, 500);
        assert_eq!(config.validation.max_diff_size, 1000);
        assert_eq!(config.validation.lock_ttl_secs, 900);
        assert_eq!(config.rate_limit.max_query_count, 50_000);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            batch_size: Some(10),
            dispatch_mode: Some(DispatchMode::Strict),
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            queue: Some(QueueConfig {
                batch_size: Some(42),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.queue.batch_size, 42);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.queue.dispatch_mode, DispatchMode::Strict);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_rejects_ttl_not_exceeding_interval() {
        let temp_dir = make_temp_db_dir();
        let mut per_type = HashMap::new();
        per_type.insert("user".to_string(), 300);
        let file_config = FileConfig {
            queue: Some(QueueConfig {
                per_type_interval_secs: Some(per_type),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("must exceed the index interval of user"));
    }

    #[test]
    fn test_resolve_rejects_non_positive_stale_running_secs() {
        let temp_dir = make_temp_db_dir();
        let file_config = FileConfig {
            queue: Some(QueueConfig {
                stale_running_secs: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap_err();
        assert!(err.to_string().contains("stale_running_secs"));
    }

    #[test]
    fn test_component_configs() {
        let temp_dir = make_temp_db_dir();
        let file_config = FileConfig {
            rate_limit: Some(RateLimitConfig {
                max_query_count: Some(10),
                ..Default::default()
            }),
            validation: Some(ValidationConfig {
                max_diff_size: Some(25),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli_for(&temp_dir), Some(file_config)).unwrap();

        let limiter = config.rate_limiter_config();
        assert_eq!(limiter.max_query_count, 10);
        assert_eq!(limiter.default_index_interval_secs, 60);
        assert_eq!(config.index_queue_config().batch_size, 250);
        assert_eq!(config.index_queue_config().stale_running_secs, 600);

        let options = config.validation_options();
        assert_eq!(options.max_diff_size, 25);
        assert_eq!(options.batch_size, 500);
        assert!(!options.do_not_heal);
    }

    #[test]
    fn test_db_path_helpers() {
        let temp_dir = make_temp_db_dir();
        let config = AppConfig::resolve(&cli_for(&temp_dir), None).unwrap();

        assert_eq!(
            config.index_queue_db_path(),
            temp_dir.path().join("index_queue.db")
        );
        assert_eq!(
            config.object_cache_db_path(),
            temp_dir.path().join("object_cache.db")
        );
    }
}
