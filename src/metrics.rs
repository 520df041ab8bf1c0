//! Metrics for controller observability
//!
//! Instruments are created on the global OpenTelemetry meter. Recording is a
//! no-op until a meter provider is installed by the embedding process.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("profile-state-controller"));

/// Histogram of reconciliation duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("profile_state_reconcile_duration_seconds")
        .with_description("Duration of profile label reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `error_class`: conflict, not_found, kube, invalid_key, namespace_missing, internal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("profile_state_reconcile_errors_total")
        .with_description("Total number of failed reconciliations")
        .with_unit("{errors}")
        .build()
});

/// Counter of label writes issued to the API server
///
/// Labels:
/// - `kind`: Profile, Namespace
pub static LABEL_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("profile_state_label_writes_total")
        .with_description("Total number of label updates written")
        .with_unit("{writes}")
        .build()
});

/// Counter of keys accepted by the work queue
pub static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("profile_state_workqueue_adds_total")
        .with_description("Total number of keys added to the work queue")
        .with_unit("{keys}")
        .build()
});

/// Counter of rate-limited requeues
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("profile_state_workqueue_retries_total")
        .with_description("Total number of rate-limited requeues")
        .with_unit("{keys}")
        .build()
});

/// Record the outcome of one reconciliation
pub fn record_reconcile(duration_secs: f64, error_class: Option<&'static str>) {
    let result = if error_class.is_some() { "error" } else { "success" };
    RECONCILE_DURATION.record(duration_secs, &[KeyValue::new("result", result)]);
    if let Some(class) = error_class {
        RECONCILE_ERRORS.add(1, &[KeyValue::new("error_class", class)]);
    }
}

/// Record a label write against `kind`
pub fn record_label_write(kind: &'static str) {
    LABEL_WRITES.add(1, &[KeyValue::new("kind", kind)]);
}
