use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reindex_queue::cache::{ObjectCache, SqliteObjectCache};
use reindex_queue::clock::{Clock, SystemClock};
use reindex_queue::config::{AppConfig, CliConfig, FileConfig};
use reindex_queue::index_queue::{queue_counts, DispatchMode, JobStore, RateLimiter, SqliteJobStore};
use reindex_queue::metrics;
use reindex_queue::validator::{ValidationError, ValidationLock};

mod cli_style;
use cli_style::{get_styles, print_error, print_key_value, print_success, print_warning, TableBuilder};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles = get_styles(), version, about = "Operator tool for the re-index queue")]
struct CliArgs {
    /// Directory holding index_queue.db and object_cache.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Values in it override command line flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Dispatch mode the queue workers are configured with.
    #[clap(long, value_parser = parse_dispatch_mode)]
    pub dispatch_mode: Option<DispatchMode>,

    /// Print JSON instead of tables.
    #[clap(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Subcommand, Debug)]
enum AdminCommand {
    /// Shows queued, due and running jobs per object type.
    QueueStats,

    /// Deletes every job from the queue.
    PurgeQueue {
        /// Confirm the purge.
        #[clap(long)]
        yes: bool,
    },

    /// Returns jobs stuck in running past the stale timeout to the queue.
    RecoverStaleJobs,

    /// Shows the active query and indexing rate limit windows.
    RateLimits,

    /// Deletes expired entries from the object cache.
    PurgeExpiredCache,

    /// Shows whether a content validation is running.
    ValidationStatus,

    /// Asks the running content validation to stop after its current batch.
    StopValidateContents,

    /// Prints the queue metrics in the Prometheus text format.
    Metrics,
}

fn parse_dispatch_mode(s: &str) -> Result<DispatchMode, String> {
    match s {
        "best_effort" | "best-effort" => Ok(DispatchMode::BestEffort),
        "strict" => Ok(DispatchMode::Strict),
        other => Err(format!(
            "unknown dispatch mode '{}', expected best_effort or strict",
            other
        )),
    }
}

struct AdminContext {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    cache: Arc<dyn ObjectCache>,
    job_store: SqliteJobStore,
}

impl AdminContext {
    fn open(config: AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cache = Arc::new(
            SqliteObjectCache::new(config.object_cache_db_path(), clock.clone())
                .context("Failed to open object cache")?,
        );
        let job_store = SqliteJobStore::new(config.index_queue_db_path())
            .context("Failed to open index queue")?;
        Ok(Self {
            config,
            clock,
            cache,
            job_store,
        })
    }

    fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(
            self.cache.clone(),
            self.clock.clone(),
            self.config.rate_limiter_config(),
        )
    }

    fn validation_lock(&self) -> ValidationLock {
        ValidationLock::new(
            self.cache.clone(),
            self.clock.clone(),
            self.config.validation.lock_ttl_secs,
        )
    }
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn queue_stats(ctx: &AdminContext, json: bool) -> Result<()> {
    let counts = queue_counts(&ctx.job_store, ctx.clock.now())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }
    if counts.is_empty() {
        print_success("The index queue is empty");
        return Ok(());
    }

    let mut table = TableBuilder::new(&["type", "queued", "due now", "running"]);
    for c in &counts {
        table.add_row(vec![
            c.object_type.to_string(),
            c.queued.to_string(),
            c.queued_due.to_string(),
            c.running.to_string(),
        ]);
    }
    table.print();
    print_key_value("dispatch mode", &format!("{:?}", ctx.config.queue.dispatch_mode));
    print_key_value("batch size", &ctx.config.queue.batch_size.to_string());
    Ok(())
}

fn purge_queue(ctx: &AdminContext, yes: bool) -> Result<()> {
    if !yes {
        print_warning("This deletes every queued and running job, pass --yes to confirm");
        return Ok(());
    }
    let purged = ctx.job_store.purge_all()?;
    tracing::info!("Purged {} jobs from the index queue", purged);
    print_success(&format!("Purged {} jobs", purged));
    Ok(())
}

fn recover_stale_jobs(ctx: &AdminContext) -> Result<()> {
    let claimed_before = ctx.clock.now() - ctx.config.queue.stale_running_secs;
    let released = ctx.job_store.release_stale_running(claimed_before)?;
    print_success(&format!("Returned {} stale running jobs to the queue", released));
    Ok(())
}

fn purge_expired_cache(ctx: &AdminContext) -> Result<()> {
    let removed = ctx.cache.purge_expired()?;
    tracing::info!("Purged {} expired entries from the object cache", removed);
    print_success(&format!("Purged {} expired cache entries", removed));
    Ok(())
}

fn rate_limits(ctx: &AdminContext, json: bool) -> Result<()> {
    let windows = ctx.rate_limiter().active_windows();
    if json {
        println!("{}", serde_json::to_string_pretty(&windows)?);
        return Ok(());
    }
    if windows.is_empty() {
        print_success("No rate limiting found!");
        return Ok(());
    }

    let now = ctx.clock.now();
    let mut table = TableBuilder::new(&["type", "start_time", "readable_start_time", "info"]);
    for window in &windows {
        table.add_row(vec![
            window.kind.as_str().to_string(),
            window.start_time.to_string(),
            format!("{}s ago", (now - window.start_time).max(0)),
            window.info.clone(),
        ]);
    }
    table.print();
    Ok(())
}

fn validation_status(ctx: &AdminContext, json: bool) -> Result<()> {
    let lock = ctx.validation_lock();
    let started_at = lock.started_at();
    let abort_requested = lock.is_abort_requested();
    if json {
        let status = serde_json::json!({
            "running": started_at.is_some(),
            "started_at": started_at,
            "abort_requested": abort_requested,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match started_at {
        Some(started_at) => {
            print_warning("A content validation is running");
            print_key_value("started at", &format_timestamp(started_at));
            print_key_value("abort requested", &abort_requested.to_string());
        }
        None => print_success("No content validation is running"),
    }
    Ok(())
}

fn stop_validate_contents(ctx: &AdminContext) -> Result<()> {
    match ctx.validation_lock().request_abort() {
        Ok(()) => {
            print_success("Requested the running content validation to stop");
            Ok(())
        }
        Err(ValidationError::NotRunning) => {
            print_warning("No content validation is running");
            Ok(())
        }
        Err(ValidationError::AbortAlreadyRequested) => {
            print_warning("A stop was already requested, waiting for the current batch to end");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_metrics(ctx: &AdminContext) -> Result<()> {
    metrics::init_metrics();
    let counts = queue_counts(&ctx.job_store, ctx.clock.now())?;
    metrics::record_queue_counts(&counts);
    print!("{}", metrics::gather_text()?);
    Ok(())
}

fn run(cli_args: CliArgs) -> Result<()> {
    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        batch_size: None,
        dispatch_mode: cli_args.dispatch_mode,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    tracing::debug!("Resolved config: {:?}", config);

    let ctx = AdminContext::open(config)?;
    match cli_args.command {
        AdminCommand::QueueStats => queue_stats(&ctx, cli_args.json),
        AdminCommand::PurgeQueue { yes } => purge_queue(&ctx, yes),
        AdminCommand::RecoverStaleJobs => recover_stale_jobs(&ctx),
        AdminCommand::RateLimits => rate_limits(&ctx, cli_args.json),
        AdminCommand::PurgeExpiredCache => purge_expired_cache(&ctx),
        AdminCommand::ValidationStatus => validation_status(&ctx, cli_args.json),
        AdminCommand::StopValidateContents => stop_validate_contents(&ctx),
        AdminCommand::Metrics => print_metrics(&ctx),
    }
}

fn main() {
    let cli_args = CliArgs::parse();

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init();

    if let Err(e) = run(cli_args) {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
