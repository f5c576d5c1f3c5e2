//! Prometheus metrics for the lattice controller manager
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `lattice_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `lattice_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `lattice_work_queue_depth` (gauge): keys waiting in each controller's queue.
//! - `lattice_iac_invocations_total` (counter): IaC engine runs labeled by operation and outcome.
//! - `lattice_iac_orphaned_state_total` (counter): destroys that failed and left remote state behind.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "node-pool"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind, e.g. "conflict", "iac", "panic"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IacLabels {
    /// plan, apply, destroy or output
    pub operation: String,
    /// success, changes, error or timeout
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OrphanLabels {
    /// Infrastructure kind, e.g. "node-pool-epoch"
    pub kind: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static WORK_QUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static IAC_INVOCATIONS_TOTAL: Lazy<Family<IacLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static IAC_ORPHANED_STATE_TOTAL: Lazy<Family<OrphanLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry. Counters are registered without the `_total`
/// suffix; the encoder appends it.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "lattice_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "lattice_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "lattice_work_queue_depth",
        "Keys waiting to be reconciled",
        WORK_QUEUE_DEPTH.clone(),
    );
    registry.register(
        "lattice_iac_invocations",
        "IaC engine invocations by operation and outcome",
        IAC_INVOCATIONS_TOTAL.clone(),
    );
    registry.register(
        "lattice_iac_orphaned_state",
        "Failed destroys that left remote IaC state behind",
        IAC_ORPHANED_STATE_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn record_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(queue: &str, depth: usize) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    WORK_QUEUE_DEPTH
        .get_or_create(&labels)
        .set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn record_iac_invocation(operation: &str, outcome: &str) {
    let labels = IacLabels {
        operation: operation.to_string(),
        outcome: outcome.to_string(),
    };
    IAC_INVOCATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn record_orphaned_state(kind: &str) {
    let labels = OrphanLabels {
        kind: kind.to_string(),
    };
    IAC_ORPHANED_STATE_TOTAL.get_or_create(&labels).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_encodes_lattice_metrics() {
        observe_reconcile("service", 0.25);
        record_reconcile_error("service", "conflict");
        set_queue_depth("service", 3);
        record_iac_invocation("plan", "success");
        record_orphaned_state("node-pool-epoch");

        let mut out = String::new();
        encode(&mut out, &REGISTRY).unwrap();
        assert!(out.contains("lattice_reconcile_duration_seconds"));
        assert!(out.contains("lattice_work_queue_depth{queue=\"service\"} 3"));
        assert!(out.contains("lattice_iac_orphaned_state_total"));
    }
}
