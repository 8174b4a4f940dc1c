//! Progress reporting
//!
//! The coordinator calls the [`ProgressReporter`] synchronously when an item
//! starts, when it finishes and once when the run ends. Implementations must
//! return quickly; a UI layer should hand the values off to its own thread.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

use super::aggregator::RunReport;
use crate::models::ItemId;

/// Receives progress of a run
pub trait ProgressReporter: Send + Sync {
    /// `current` items finished out of `total`, with the titles still in flight
    fn on_progress(&self, current: usize, total: usize, in_flight: &[String]);

    /// The run reached its final state
    fn on_completed(&self, report: &RunReport);
}

/// Reporter that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_progress(&self, _current: usize, _total: usize, _in_flight: &[String]) {}

    fn on_completed(&self, _report: &RunReport) {}
}

/// Reporter logging through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn on_progress(&self, current: usize, total: usize, in_flight: &[String]) {
        info!(current, total, in_flight = ?in_flight, "Library update progress");
    }

    fn on_completed(&self, report: &RunReport) {
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            attempted = report.attempted,
            new = report.succeeded_with_new.len(),
            failed = report.failures.len(),
            "Library update finished"
        );
    }
}

/// Shared progress counters of one run
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    total: usize,
    finished: AtomicUsize,
    in_flight: Mutex<BTreeMap<ItemId, String>>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>, total: usize) -> Self {
        Self {
            reporter,
            total,
            finished: AtomicUsize::new(0),
            in_flight: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn start(&self, id: ItemId, title: &str) {
        let titles = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.insert(id, title.to_string());
            in_flight.values().cloned().collect::<Vec<_>>()
        };
        self.reporter
            .on_progress(self.finished.load(Ordering::SeqCst), self.total, &titles);
    }

    pub fn finish(&self, id: ItemId) {
        let titles = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.remove(&id);
            in_flight.values().cloned().collect::<Vec<_>>()
        };
        let finished = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        self.reporter.on_progress(finished, self.total, &titles);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
