//! Prometheus metrics for the lifecycle engine.

use cabinet_metadata::RetryObserver;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global metrics registry.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// =============================================================================
// Upload lifecycle
// =============================================================================

pub static UPLOADS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("cabinet_uploads_started_total", "Multipart uploads started")
        .expect("metric creation failed")
});

pub static UPLOADS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cabinet_uploads_completed_total",
        "Multipart uploads completed",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cabinet_uploads_aborted_total",
        "Uploads aborted by the client",
    )
    .expect("metric creation failed")
});

// =============================================================================
// Transactions
// =============================================================================

pub static TX_RETRIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cabinet_tx_retries_total",
            "Transactions re-run after a serialization failure",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

pub static TX_RETRIES_EXHAUSTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cabinet_tx_retries_exhausted_total",
            "Transactions that failed every attempt",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

/// Blob side effects whose relational write did not follow.
pub static INCONSISTENCY_WINDOWS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cabinet_inconsistency_windows_total",
            "Blob store changes left without a matching metadata change",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

// =============================================================================
// Blob store
// =============================================================================

pub static BLOB_OBJECTS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cabinet_blob_objects_deleted_total",
        "Finalized blob objects deleted",
    )
    .expect("metric creation failed")
});

pub static BLOB_UPLOADS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cabinet_blob_uploads_aborted_total",
        "Multipart uploads aborted in the blob store",
    )
    .expect("metric creation failed")
});

// =============================================================================
// Sweep
// =============================================================================

pub static SWEEP_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("cabinet_sweep_runs_total", "Reconciliation sweeps run"),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static SWEEP_LAST_ABORTED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "cabinet_sweep_last_uploads_aborted",
        "Uploads aborted by the most recent sweep",
    )
    .expect("metric creation failed")
});

pub static SWEEP_LAST_DELETED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "cabinet_sweep_last_objects_deleted",
        "Objects deleted by the most recent sweep",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS_STARTED.clone()),
            Box::new(UPLOADS_COMPLETED.clone()),
            Box::new(UPLOADS_ABORTED.clone()),
            Box::new(TX_RETRIES.clone()),
            Box::new(TX_RETRIES_EXHAUSTED.clone()),
            Box::new(INCONSISTENCY_WINDOWS.clone()),
            Box::new(BLOB_OBJECTS_DELETED.clone()),
            Box::new(BLOB_UPLOADS_ABORTED.clone()),
            Box::new(SWEEP_RUNS.clone()),
            Box::new(SWEEP_LAST_ABORTED.clone()),
            Box::new(SWEEP_LAST_DELETED.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "metric registration failed");
            }
        }
    });
}

/// Render every registered metric in the text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a logged inconsistency window.
pub fn record_inconsistency(operation: &str) {
    INCONSISTENCY_WINDOWS.with_label_values(&[operation]).inc();
}

/// Record blob store cleanup counts.
pub fn record_blob_cleanup(stats: &cabinet_storage::DeleteStats) {
    BLOB_OBJECTS_DELETED.inc_by(stats.objects_deleted);
    BLOB_UPLOADS_ABORTED.inc_by(stats.uploads_aborted);
}

/// Feeds retry executor events into the transaction counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRetryObserver;

impl RetryObserver for MetricsRetryObserver {
    fn on_retry(&self, operation: &'static str, _attempt: u32) {
        TX_RETRIES.with_label_values(&[operation]).inc();
    }

    fn on_exhausted(&self, operation: &'static str, _attempts: u32) {
        TX_RETRIES_EXHAUSTED.with_label_values(&[operation]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_observer_counts_retries() {
        register_metrics();
        let before = TX_RETRIES.with_label_values(&["metrics test"]).get();
        MetricsRetryObserver.on_retry("metrics test", 1);
        MetricsRetryObserver.on_exhausted("metrics test", 3);
        assert_eq!(
            TX_RETRIES.with_label_values(&["metrics test"]).get(),
            before + 1
        );
        assert!(gather_metrics().contains("cabinet_tx_retries_exhausted_total"));
    }
}
