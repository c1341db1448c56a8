//! # Metrics
//!
//! Prometheus metrics for monitoring the controllers.
//!
//! ## Metrics Exposed
//!
//! - `encryption_controller_reconciliations_total` - Reconciliations per controller
//! - `encryption_controller_reconciliation_errors_total` - Failed reconciliations per controller
//! - `encryption_controller_reconciliation_duration_seconds` - Reconciliation duration per controller
//! - `encryption_controller_requeues_total` - Requeues per controller and reason
//! - `encryption_keys_created_total` - Keys minted per mode
//! - `encryption_keys_pruned_total` - Key objects deleted
//! - `encryption_config_updates_total` - Writes of the published configuration
//! - `encryption_migrated_objects_total` - Objects rewritten per resource type
//! - `encryption_migrations_completed_total` - Completed migrations per resource type

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "encryption_controller_reconciliations_total",
            "Total number of reconciliations by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "encryption_controller_reconciliation_errors_total",
            "Total number of reconciliation errors by controller",
        ),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "encryption_controller_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds by controller",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 120.0]),
        &["controller"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "encryption_controller_requeues_total",
            "Total number of requeues by controller and reason",
        ),
        &["controller", "reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static KEYS_CREATED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "encryption_keys_created_total",
            "Total number of encryption keys minted by mode",
        ),
        &["mode"],
    )
    .expect("Failed to create KEYS_CREATED_TOTAL metric - this should never happen")
});

static KEYS_PRUNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "encryption_keys_pruned_total",
        "Total number of encryption key objects deleted",
    )
    .expect("Failed to create KEYS_PRUNED_TOTAL metric - this should never happen")
});

static CONFIG_UPDATES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "encryption_config_updates_total",
        "Total number of writes of the published encryption configuration",
    )
    .expect("Failed to create CONFIG_UPDATES_TOTAL metric - this should never happen")
});

static MIGRATED_OBJECTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "encryption_migrated_objects_total",
            "Total number of stored objects rewritten by resource type",
        ),
        &["resource"],
    )
    .expect("Failed to create MIGRATED_OBJECTS_TOTAL metric - this should never happen")
});

static MIGRATIONS_COMPLETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "encryption_migrations_completed_total",
            "Total number of completed storage migrations by resource type",
        ),
        &["resource"],
    )
    .expect("Failed to create MIGRATIONS_COMPLETED_TOTAL metric - this should never happen")
});

/// Register all metrics with the registry
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KEYS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(KEYS_PRUNED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONFIG_UPDATES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MIGRATED_OBJECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MIGRATIONS_COMPLETED_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(controller: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[controller]).inc();
}

pub fn increment_reconciliation_errors(controller: &str) {
    RECONCILIATION_ERRORS_TOTAL
        .with_label_values(&[controller])
        .inc();
}

pub fn observe_reconciliation_duration(controller: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[controller])
        .observe(duration);
}

pub fn increment_requeues_total(controller: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[controller, reason]).inc();
}

/// Requeues recorded so far for a controller and reason
pub fn requeues_total(controller: &str, reason: &str) -> u64 {
    REQUEUES_TOTAL.with_label_values(&[controller, reason]).get()
}

pub fn increment_keys_created(mode: &str) {
    KEYS_CREATED_TOTAL.with_label_values(&[mode]).inc();
}

pub fn increment_keys_pruned() {
    KEYS_PRUNED_TOTAL.inc();
}

pub fn increment_config_updates() {
    CONFIG_UPDATES_TOTAL.inc();
}

pub fn increment_migrated_objects(resource: &str, count: u64) {
    MIGRATED_OBJECTS_TOTAL
        .with_label_values(&[resource])
        .inc_by(count);
}

pub fn increment_migrations_completed(resource: &str) {
    MIGRATIONS_COMPLETED_TOTAL
        .with_label_values(&[resource])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_move() {
        let before = KEYS_CREATED_TOTAL.with_label_values(&["aescbc"]).get();
        increment_keys_created("aescbc");
        assert_eq!(
            KEYS_CREATED_TOTAL.with_label_values(&["aescbc"]).get(),
            before + 1
        );
    }

    #[test]
    fn test_requeue_labels() {
        increment_requeues_total("EncryptionKeyController", "error-backoff");
        assert!(
            REQUEUES_TOTAL
                .with_label_values(&["EncryptionKeyController", "error-backoff"])
                .get()
                >= 1
        );
    }
}
