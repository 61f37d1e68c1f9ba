//! Prometheus metrics for matching-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "matching_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for engine operations by outcome.
pub static MATCH_OPERATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_operations_total",
        "Total number of matching engine operations",
        &["operation", "status"]
    )
    .expect("Failed to register MATCH_OPERATIONS")
});

/// Counter for transactions classified, by method (manual/auto/ignored).
pub static TRANSACTIONS_CLASSIFIED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_transactions_classified_total",
        "Total number of transactions classified",
        &["method"]
    )
    .expect("Failed to register TRANSACTIONS_CLASSIFIED")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "matching_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&MATCH_OPERATIONS);
    Lazy::force(&TRANSACTIONS_CLASSIFIED);
    Lazy::force(&ERRORS);
}

/// Render all metrics in Prometheus text format.
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Record an engine operation outcome.
pub fn record_match_operation(operation: &str, status: &str) {
    MATCH_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

/// Record classified transactions.
pub fn record_transactions_classified(method: &str, count: u64) {
    TRANSACTIONS_CLASSIFIED
        .with_label_values(&[method])
        .inc_by(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
