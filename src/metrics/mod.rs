//! Prometheus metrics for library update runs
//!
//! This module provides metrics tracking for:
//! - Runs: count by final status and target, run duration
//! - Items: outcomes, inserted chapters, updates in flight
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all update metrics
struct UpdateMetrics {
    runs: CounterVec,
    run_duration: HistogramVec,
    items: CounterVec,
    new_chapters: Counter,
    in_flight: Gauge,
}

/// Global storage for update metrics
static UPDATE_METRICS: OnceLock<UpdateMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, subsequent metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = shelf_updater::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = UpdateMetrics {
        runs: register_counter_vec!(
            "shelf_update_runs_total",
            "Library update runs by final status and target",
            &["status", "target"]
        )?,
        run_duration: register_histogram_vec!(
            "shelf_update_run_duration_seconds",
            "Wall time of library update runs",
            &["target"],
            vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
        )?,
        items: register_counter_vec!(
            "shelf_update_items_total",
            "Item updates by outcome",
            &["outcome"]
        )?,
        new_chapters: register_counter!(
            "shelf_update_new_chapters_total",
            "Chapters inserted by library updates"
        )?,
        in_flight: register_gauge!(
            "shelf_update_items_in_flight",
            "Item updates currently running"
        )?,
    };

    UPDATE_METRICS.set(metrics).ok();
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    UPDATE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished run
pub fn record_run(status: &str, target: &str, duration_secs: f64) {
    let Some(m) = UPDATE_METRICS.get() else {
        return;
    };

    m.runs.with_label_values(&[status, target]).inc();
    m.run_duration
        .with_label_values(&[target])
        .observe(duration_secs);
}

/// Record the outcome of one item
pub fn record_item(outcome: &str) {
    if let Some(m) = UPDATE_METRICS.get() {
        m.items.with_label_values(&[outcome]).inc();
    }
}

/// Record inserted chapters
pub fn record_new_chapters(count: usize) {
    if let Some(m) = UPDATE_METRICS.get() {
        m.new_chapters.inc_by(count as f64);
    }
}

/// An item update started
pub fn item_started() {
    if let Some(m) = UPDATE_METRICS.get() {
        m.in_flight.inc();
    }
}

/// An item update finished
pub fn item_finished() {
    if let Some(m) = UPDATE_METRICS.get() {
        m.in_flight.dec();
    }
}

// ============================================================================
// Tests
// ============================================================================
