use lazy_static::lazy_static;
use crate::index_queue::QueueCounts;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Metric name prefix for all re-index metrics
const PREFIX: &str = "reindex";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref QUEUE_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_queue_enqueued_total"), "Enqueue requests by outcome"),
        &["object_type", "outcome"]
    ).expect("Failed to create queue_enqueued_total metric");

    pub static ref QUEUE_DISPATCHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_queue_dispatched_total"), "Dispatched jobs by outcome"),
        &["object_type", "outcome"]
    ).expect("Failed to create queue_dispatched_total metric");

    pub static ref QUEUE_BATCH_SIZE: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_queue_batch_size"),
            "Number of jobs claimed per pulled batch"
        )
        .buckets(vec![1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0])
    ).expect("Failed to create queue_batch_size metric");

    pub static ref QUEUE_JOBS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_jobs"), "Jobs currently in the queue"),
        &["object_type", "status"]
    ).expect("Failed to create queue_jobs metric");

    // Validation Metrics
    pub static ref VALIDATION_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_validation_runs_total"), "Validation runs by terminal status"),
        &["status"]
    ).expect("Failed to create validation_runs_total metric");

    pub static ref VALIDATION_DIFF_ENTRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_validation_diff_entries_total"), "Drift entries found by issue"),
        &["issue"]
    ).expect("Failed to create validation_diff_entries_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(QUEUE_ENQUEUED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_DISPATCHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_BATCH_SIZE.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOBS.clone()));
    let _ = REGISTRY.register(Box::new(VALIDATION_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(VALIDATION_DIFF_ENTRIES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record the outcome of an enqueue request
pub fn record_enqueue(object_type: &str, outcome: &str) {
    QUEUE_ENQUEUED_TOTAL
        .with_label_values(&[object_type, outcome])
        .inc();
}

/// Record dispatched jobs for one object type
pub fn record_dispatch(object_type: &str, outcome: &str, count: usize) {
    if count == 0 {
        return;
    }
    QUEUE_DISPATCHED_TOTAL
        .with_label_values(&[object_type, outcome])
        .inc_by(count as f64);
}

pub fn record_batch_size(size: usize) {
    QUEUE_BATCH_SIZE.observe(size as f64);
}

/// Set the queue depth gauges from a counts snapshot
pub fn record_queue_counts(counts: &[QueueCounts]) {
    for c in counts {
        let object_type = c.object_type.as_str();
        QUEUE_JOBS
            .with_label_values(&[object_type, "queued"])
            .set(c.queued as f64);
        QUEUE_JOBS
            .with_label_values(&[object_type, "queued_due"])
            .set(c.queued_due as f64);
        QUEUE_JOBS
            .with_label_values(&[object_type, "running"])
            .set(c.running as f64);
    }
}

pub fn record_validation_run(status: &str) {
    VALIDATION_RUNS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_diff_entry(issue: &str) {
    VALIDATION_DIFF_ENTRIES_TOTAL
        .with_label_values(&[issue])
        .inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        // Calling twice must not panic
        init_metrics();
    }

    #[test]
    fn test_gather_text_contains_prefixed_metrics() {
        init_metrics();
        record_enqueue("post", "queued");
        record_validation_run("completed");
        record_queue_counts(&[QueueCounts {
            object_type: "post".into(),
            queued: 3,
            queued_due: 1,
            running: 0,
        }]);

        let text = gather_text().unwrap();
        assert!(text.contains("reindex_queue_enqueued_total"));
        assert!(text.contains("reindex_validation_runs_total"));
        assert!(text.contains("reindex_queue_jobs{object_type=\"post\",status=\"queued\"} 3"));
    }
}
