//! Library update scheduling
//!
//! This module selects which favorited series to refresh, fetches their
//! chapter lists under bounded concurrency with per-source pacing, merges
//! the results into the library and reports the outcome of the run.
//!
//! # Architecture
//!
//! ```text
//!  UpdateJob::start_run(scope, target)
//!        │
//!        ▼
//!  ┌──────────────┐  overlapping scope active? ──► RejectedAlreadyRunning
//!  │ RunRegistry  │
//!  └──────┬───────┘
//!         ▼
//!  ┌──────────────┐  categories, restrictions, fetch window
//!  │  selection   │──────────────────────────────► skipped items
//!  └──────┬───────┘
//!         ▼
//!  ┌──────────────────────────┐
//!  │ ConcurrencyCoordinator   │  one lane per source, shared slot pool
//!  │   SourceThrottle         │  adaptive delay / quota per source
//!  │   ItemWork (updater)     │  fetch ─► reconcile ─► apply ─► schedule
//!  └──────┬───────────────────┘
//!         ▼
//!  ┌──────────────────────────┐
//!  │ OutcomeAggregator        │  downloads, events, error log, RunReport
//!  └──────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`selection`] - scopes, targets and candidate selection
//! - [`window`] - the fetch window and the clock abstraction
//! - [`interval`] - release interval estimation and next expected update
//! - [`reconcile`] - diff of remote against local chapter lists
//! - [`throttle`] - per-source request pacing
//! - [`updater`] - per-item work units
//! - [`coordinator`] - bounded concurrent execution
//! - [`aggregator`] - outcome collection and the run report
//! - [`registry`] - active run bookkeeping
//! - [`progress`] - progress callbacks
//! - [`job`] - the run lifecycle
//!
//! # Quick Start
//!
//! ```ignore
//! use shelf_updater::scheduler::{UpdateJob, UpdateScope, UpdateTarget};
//!
//! let job = UpdateJob::builder(repo, catalog).config(config).build();
//! let handle = job.start_run(UpdateScope::Library, UpdateTarget::Chapters);
//! let report = handle.wait().await?;
//! println!("{}: {} new chapters", report.status, report.new_chapter_count());
//! ```
//!
//! # Defaults
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `global_concurrency` | 5 | Item updates in flight across all sources |
//! | `per_source_concurrency` | 1 | Item updates in flight per source |
//! | `slot_timeout_secs` | none | Wait for a worker slot before failing an item |
//! | grace period | 1 day | Fetch window extends one day around today |
//! | interval cap | 28 days | Upper bound of an estimated release interval |

pub mod aggregator;
pub mod coordinator;
pub mod error;
pub mod interval;
pub mod job;
pub mod progress;
pub mod reconcile;
pub mod registry;
pub mod selection;
pub mod throttle;
pub mod updater;
pub mod window;

// Re-export main types
pub use aggregator::{
    should_auto_download, ItemFailure, ItemRef, OutcomeAggregator, RunReport, RunStatus,
    RunSummary, UpdatedItem,
};
pub use coordinator::ConcurrencyCoordinator;
pub use error::{SchedulerError, SchedulerResult};
pub use interval::{estimate_interval, next_schedule, FetchSchedule};
pub use job::{RunHandle, RunState, UpdateJob, UpdateJobBuilder};
pub use progress::{NoopReporter, ProgressReporter, ProgressTracker, TracingReporter};
pub use reconcile::{reconcile, ChapterDiff};
pub use registry::{scopes_overlap, ActiveRun, RunGuard, RunRegistry};
pub use selection::{
    select, validate_scope, ExcludedItem, ExclusionReason, LibraryGroup, Selection, UpdateScope,
    UpdateTarget,
};
pub use throttle::{AdaptiveDelay, SourceThrottle, ThrottlePolicy};
pub use updater::{
    CoverWork, FailureKind, ItemError, ItemUpdater, ItemWork, TrackingWork, UpdateOutcome,
};
pub use window::{Clock, FetchWindow, FixedClock, SystemClock};
