//! Downstream effects of a library update
//!
//! The scheduler never renders notifications or downloads chapters itself.
//! It hands batched [`UpdateEvent`]s to an [`EventSink`], download requests
//! to a [`DownloadManager`] and failure write-ups to an [`ErrorLogWriter`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │          OutcomeAggregator                 │
//! │  - auto-download decision per item         │
//! │  - one batched event per run               │
//! └────────────────────────────────────────────┘
//!                     │
//!         ┌───────────┼───────────┐
//!         ▼           ▼           ▼
//!   ┌──────────┐ ┌──────────┐ ┌──────────┐
//!   │ Download │ │  Event   │ │  Error   │
//!   │ Manager  │ │   Sink   │ │   Log    │
//!   └──────────┘ └──────────┘ └──────────┘
//! ```

pub mod error_log;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::models::{Chapter, LibraryItem};
use crate::scheduler::aggregator::ItemRef;

pub use error_log::{ErrorLogWriter, FileErrorLog};

/// Result type for notification operations
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur while delivering run effects
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// Writing an artifact failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sink temporarily unavailable
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// New chapters of one item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewChaptersEntry {
    pub item: ItemRef,
    pub chapters: Vec<Chapter>,
}

/// Batched run events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    /// Every item that received chapters during the run
    NewChapters {
        run_id: Uuid,
        entries: Vec<NewChaptersEntry>,
    },

    /// Failure summary with a pointer to the detailed log
    UpdateErrors {
        run_id: Uuid,
        failed: usize,
        error_log: Option<PathBuf>,
    },
}

impl UpdateEvent {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewChapters { .. } => "new_chapters",
            Self::UpdateErrors { .. } => "update_errors",
        }
    }
}

/// Receives batched run events, e.g. a notification renderer
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &UpdateEvent) -> NotificationResult<()>;
}

/// Queues chapter downloads. Fire-and-forget.
pub trait DownloadManager: Send + Sync {
    fn request_download(&self, item: &LibraryItem, chapters: &[Chapter]);
}

/// Sink that logs events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &UpdateEvent) -> NotificationResult<()> {
        match event {
            UpdateEvent::NewChapters { run_id, entries } => {
                let chapters: usize = entries.iter().map(|e| e.chapters.len()).sum();
                info!(run_id = %run_id, items = entries.len(), chapters, "New chapters found");
            }
            UpdateEvent::UpdateErrors {
                run_id,
                failed,
                error_log,
            } => {
                info!(
                    run_id = %run_id,
                    failed,
                    error_log = ?error_log,
                    "Library update had failures"
                );
            }
        }
        Ok(())
    }
}

/// Download manager that ignores every request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDownloads;

impl DownloadManager for NoopDownloads {
    fn request_download(&self, _item: &LibraryItem, _chapters: &[Chapter]) {}
}
