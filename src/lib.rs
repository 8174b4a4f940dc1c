//! shelf-updater - Library update scheduler
//!
//! Refreshes the chapter lists of the series tracked in a reading library.
//! Candidates are filtered by scope and restrictions, fetched from their
//! sources under bounded concurrency with per-source pacing, reconciled
//! against local chapters and summarized in a run report.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`source`] - Remote source contract, replay source and source catalog
//! - [`storage`] - Repository contract, in-memory repository, snapshots
//! - [`scheduler`] - Selection, throttling, concurrency and the run lifecycle
//! - [`notifications`] - Update events, download requests, error logs
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - Unified error type
//!
//! # Example
//!
//! ```no_run
//! use shelf_updater::config::Config;
//! use shelf_updater::scheduler::{UpdateJob, UpdateScope, UpdateTarget};
//! use shelf_updater::storage::LibrarySnapshot;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let snapshot = LibrarySnapshot::from_file("library.json".as_ref())?;
//!     let (repo, catalog) = snapshot.load().await;
//!
//!     let job = UpdateJob::builder(repo, catalog).config(config).build();
//!     let report = job
//!         .start_run(UpdateScope::Library, UpdateTarget::Chapters)
//!         .wait()
//!         .await?;
//!     println!("{} new chapters", report.new_chapter_count());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod scheduler;
pub mod source;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, RunConfiguration};
    pub use crate::error::{Error, ErrorCategory, Result, UpdaterErrorTrait};
    pub use crate::models::{Chapter, ItemId, LibraryItem, RemoteChapter, SourceId};
    pub use crate::scheduler::{RunHandle, RunReport, RunStatus, UpdateJob, UpdateScope, UpdateTarget};
    pub use crate::source::{SourceCatalog, SourceClient};
    pub use crate::storage::{MemoryRepository, Repository};
}

// Direct re-exports for convenience
pub use models::{Chapter, LibraryItem};
