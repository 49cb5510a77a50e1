//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `kubeall_reconciliations_total` - Total number of reconciliations by kind
//! - `kubeall_reconciliation_errors_total` - Total number of reconciliation errors
//! - `kubeall_status_propagations_total` - Total number of status updates projected onto images
//! - `kubeall_uploads_total` - Total number of image uploads started
//! - `kubeall_upload_errors_total` - Total number of failed image uploads
//! - `kubeall_upload_duration_seconds` - Duration of image uploads

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kubeall_reconciliations_total",
            "Total number of reconciliations by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kubeall_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static STATUS_PROPAGATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kubeall_status_propagations_total",
        "Total number of backing image status updates projected onto images",
    )
    .expect("Failed to create STATUS_PROPAGATIONS_TOTAL metric - this should never happen")
});

static UPLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("kubeall_uploads_total", "Total number of image uploads started")
        .expect("Failed to create UPLOADS_TOTAL metric - this should never happen")
});

static UPLOAD_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kubeall_upload_errors_total",
        "Total number of failed image uploads",
    )
    .expect("Failed to create UPLOAD_ERRORS_TOTAL metric - this should never happen")
});

static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kubeall_upload_duration_seconds",
            "Duration of image uploads in seconds",
        )
        .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 600.0, 1800.0]),
    )
    .expect("Failed to create UPLOAD_DURATION metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STATUS_PROPAGATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPLOAD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(UPLOAD_DURATION.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn increment_status_propagations() {
    STATUS_PROPAGATIONS_TOTAL.inc();
}

pub fn increment_uploads() {
    UPLOADS_TOTAL.inc();
}

pub fn increment_upload_errors() {
    UPLOAD_ERRORS_TOTAL.inc();
}

pub fn observe_upload_duration(duration: f64) {
    UPLOAD_DURATION.observe(duration);
}
