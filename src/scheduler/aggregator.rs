//! Outcome aggregation and the run report
//!
//! Workers append outcomes as they finish. The aggregator decides per item
//! whether new chapters go to the download manager, and at the end of the
//! run builds the [`RunReport`] and emits at most one new-chapters event and
//! one error-summary event.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::selection::{ExcludedItem, UpdateScope, UpdateTarget};
use super::updater::{FailureKind, UpdateOutcome};
use crate::config::AutoDownloadPolicy;
use crate::error::ErrorCategory;
use crate::metrics;
use crate::models::{Chapter, ItemId, LibraryItem};
use crate::notifications::{DownloadManager, ErrorLogWriter, EventSink, NewChaptersEntry, UpdateEvent};

/// Enough of an item to render a report line without querying the library
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemRef {
    pub item_id: ItemId,
    pub title: String,
    pub source_name: String,
}

/// Item that received new chapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdatedItem {
    pub item: ItemRef,
    pub new_chapters: usize,
    pub download_requested: bool,
}

/// Item whose update failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: ItemRef,
    pub kind: FailureKind,
    pub message: String,
}

/// Final state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithFailures,
    Cancelled,
    RejectedAlreadyRunning,
    /// Candidate selection failed, no item was touched
    Aborted,
}

impl RunStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithFailures => "completed_with_failures",
            Self::Cancelled => "cancelled",
            Self::RejectedAlreadyRunning => "rejected_already_running",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Summary of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub scope: UpdateScope,
    pub target: UpdateTarget,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items whose work unit was started
    pub attempted: usize,
    pub succeeded_with_new: Vec<UpdatedItem>,
    pub succeeded_no_change: Vec<ItemRef>,
    pub failures: Vec<ItemFailure>,
    /// Items matching the scope that were filtered out
    pub skipped: Vec<ExcludedItem>,
    pub error_log: Option<PathBuf>,
    pub abort_reason: Option<String>,
    /// Classification of the abort cause
    pub abort_category: Option<ErrorCategory>,
    /// Whether the aborted run is worth retrying as is
    pub abort_retryable: bool,
}

impl RunReport {
    /// Report of a run that never processed an item
    pub fn empty(
        run_id: Uuid,
        scope: UpdateScope,
        target: UpdateTarget,
        status: RunStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            scope,
            target,
            status,
            started_at: at,
            finished_at: at,
            attempted: 0,
            succeeded_with_new: Vec::new(),
            succeeded_no_change: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            error_log: None,
            abort_reason: None,
            abort_category: None,
            abort_retryable: false,
        }
    }

    /// Failures that mark the run as failed, warnings excluded
    pub fn hard_failures(&self) -> usize {
        self.failures.iter().filter(|f| !f.kind.is_warning()).count()
    }

    /// Chapters inserted across all items
    pub fn new_chapter_count(&self) -> usize {
        self.succeeded_with_new.iter().map(|u| u.new_chapters).sum()
    }
}

/// Whether new chapters of an item should be downloaded automatically
pub fn should_auto_download(policy: &AutoDownloadPolicy, item: &LibraryItem) -> bool {
    if !policy.enabled {
        return false;
    }
    let categories = item.effective_categories();
    if categories
        .iter()
        .any(|c| policy.exclude_categories.contains(c))
    {
        return false;
    }
    policy.include_categories.is_empty()
        || categories
            .iter()
            .any(|c| policy.include_categories.contains(c))
}

#[derive(Debug)]
enum Recorded {
    New {
        chapters: Vec<Chapter>,
        download_requested: bool,
    },
    NoChange,
    Failed {
        kind: FailureKind,
        message: String,
    },
}

/// Run bookkeeping handed to [`OutcomeAggregator::finish`]
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub scope: UpdateScope,
    pub target: UpdateTarget,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub skipped: Vec<ExcludedItem>,
}

/// Concurrency-safe collector of item outcomes
pub struct OutcomeAggregator {
    run_id: Uuid,
    policy: AutoDownloadPolicy,
    downloads: Arc<dyn DownloadManager>,
    entries: Mutex<Vec<(ItemRef, Recorded)>>,
}

impl OutcomeAggregator {
    pub fn new(run_id: Uuid, policy: AutoDownloadPolicy, downloads: Arc<dyn DownloadManager>) -> Self {
        Self {
            run_id,
            policy,
            downloads,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append the outcome of one item
    pub fn record(&self, item: &LibraryItem, source_name: &str, outcome: UpdateOutcome) {
        let item_ref = ItemRef {
            item_id: item.id,
            title: item.title.clone(),
            source_name: source_name.to_string(),
        };

        let recorded = match outcome {
            UpdateOutcome::Success(chapters) if chapters.is_empty() => {
                metrics::record_item("no_change");
                Recorded::NoChange
            }
            UpdateOutcome::Success(chapters) => {
                let download_requested = should_auto_download(&self.policy, item);
                if download_requested {
                    self.downloads.request_download(item, &chapters);
                }
                metrics::record_item("new_chapters");
                metrics::record_new_chapters(chapters.len());
                Recorded::New {
                    chapters,
                    download_requested,
                }
            }
            UpdateOutcome::Failure(error) => {
                let kind = error.kind();
                if kind.is_warning() {
                    debug!(item_id = %item.id, title = %item.title, error = %error, "Item had nothing to update");
                } else {
                    warn!(item_id = %item.id, title = %item.title, source = source_name, error = %error, "Item update failed");
                }
                metrics::record_item(if kind.is_warning() { "warning" } else { "failed" });
                Recorded::Failed {
                    kind,
                    message: error.reason(),
                }
            }
        };

        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((item_ref, recorded));
    }

    /// Number of outcomes recorded so far
    pub fn recorded(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Build the report and emit the batched events
    pub async fn finish(
        &self,
        summary: RunSummary,
        events: &dyn EventSink,
        error_log: Option<&dyn ErrorLogWriter>,
    ) -> RunReport {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()));

        let mut report = RunReport::empty(
            self.run_id,
            summary.scope,
            summary.target,
            RunStatus::Completed,
            summary.started_at,
        );
        report.finished_at = summary.finished_at;
        report.attempted = entries.len();
        report.skipped = summary.skipped;

        let mut new_entries = Vec::new();
        for (item, recorded) in entries {
            match recorded {
                Recorded::New {
                    chapters,
                    download_requested,
                } => {
                    report.succeeded_with_new.push(UpdatedItem {
                        item: item.clone(),
                        new_chapters: chapters.len(),
                        download_requested,
                    });
                    new_entries.push(NewChaptersEntry { item, chapters });
                }
                Recorded::NoChange => report.succeeded_no_change.push(item),
                Recorded::Failed { kind, message } => {
                    report.failures.push(ItemFailure { item, kind, message })
                }
            }
        }

        report
            .succeeded_with_new
            .sort_by(|a, b| a.item.title.cmp(&b.item.title));
        report
            .succeeded_no_change
            .sort_by(|a, b| a.title.cmp(&b.title));
        report
            .failures
            .sort_by(|a, b| a.item.title.cmp(&b.item.title));
        new_entries.sort_by(|a, b| a.item.title.cmp(&b.item.title));

        report.status = if summary.cancelled {
            RunStatus::Cancelled
        } else if report.hard_failures() > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::Completed
        };

        if !new_entries.is_empty() {
            let event = UpdateEvent::NewChapters {
                run_id: self.run_id,
                entries: new_entries,
            };
            if let Err(e) = events.emit(&event).await {
                warn!(run_id = %self.run_id, error = %e, "Failed to emit new chapters event");
            }
        }

        if !report.failures.is_empty() {
            if let Some(writer) = error_log {
                match writer.write(self.run_id, &report.failures).await {
                    Ok(path) => report.error_log = Some(path),
                    Err(e) => warn!(run_id = %self.run_id, error = %e, "Failed to write error log"),
                }
            }
            let event = UpdateEvent::UpdateErrors {
                run_id: self.run_id,
                failed: report.failures.len(),
                error_log: report.error_log.clone(),
            };
            if let Err(e) = events.emit(&event).await {
                warn!(run_id = %self.run_id, error = %e, "Failed to emit error summary event");
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryId, RemoteChapter};
    use crate::notifications::NotificationResult;
    use crate::scheduler::updater::ItemError;
    use crate::source::SourceError;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct Events(Mutex<Vec<UpdateEvent>>);

    #[async_trait]
    impl EventSink for Events {
        async fn emit(&self, event: &UpdateEvent) -> NotificationResult<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Downloads(Mutex<Vec<ItemId>>);

    impl DownloadManager for Downloads {
        fn request_download(&self, item: &LibraryItem, _chapters: &[Chapter]) {
            self.0.lock().unwrap().push(item.id);
        }
    }

    fn chapters(n: usize) -> Vec<Chapter> {
        (0..n)
            .map(|i| Chapter::from_remote(&RemoteChapter::new(format!("/c/{i}"), "c", i as f64), i, Utc::now()))
            .collect()
    }

    fn summary(cancelled: bool) -> RunSummary {
        RunSummary {
            scope: UpdateScope::Library,
            target: UpdateTarget::Chapters,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cancelled,
            skipped: Vec::new(),
        }
    }

    fn policy(include: &[u64], exclude: &[u64]) -> AutoDownloadPolicy {
        AutoDownloadPolicy {
            enabled: true,
            include_categories: include.iter().copied().map(CategoryId).collect(),
            exclude_categories: exclude.iter().copied().map(CategoryId).collect(),
        }
    }

    #[test]
    fn test_auto_download_rules() {
        let mut item = LibraryItem::new(1, 1, "One");
        item.categories = BTreeSet::from([CategoryId(1), CategoryId(2)]);

        assert!(!should_auto_download(&AutoDownloadPolicy::default(), &item));
        assert!(should_auto_download(&policy(&[], &[]), &item));
        assert!(should_auto_download(&policy(&[2], &[]), &item));
        assert!(!should_auto_download(&policy(&[3], &[]), &item));
        assert!(!should_auto_download(&policy(&[1], &[2]), &item));

        let loose = LibraryItem::new(2, 1, "Loose");
        assert!(should_auto_download(&policy(&[0], &[]), &loose));
    }

    #[tokio::test]
    async fn test_single_batched_event() {
        let downloads = Arc::new(Downloads::default());
        let aggregator = OutcomeAggregator::new(Uuid::new_v4(), policy(&[], &[]), downloads.clone());

        let a = LibraryItem::new(1, 1, "A");
        let b = LibraryItem::new(2, 2, "B");
        let c = LibraryItem::new(3, 1, "C");
        aggregator.record(&a, "One", UpdateOutcome::Success(chapters(2)));
        aggregator.record(
            &b,
            "Two",
            UpdateOutcome::Failure(ItemError::Fetch {
                title: "B".into(),
                source: SourceError::Transport("reset".into()),
            }),
        );
        aggregator.record(&c, "One", UpdateOutcome::Success(vec![]));

        let events = Events::default();
        let report = aggregator.finish(summary(false), &events, None).await;

        assert_eq!(report.status, RunStatus::CompletedWithFailures);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded_with_new[0].item.title, "A");
        assert_eq!(report.succeeded_with_new[0].new_chapters, 2);
        assert_eq!(report.succeeded_no_change[0].title, "C");
        assert_eq!(report.failures[0].item.source_name, "Two");
        assert_eq!(*downloads.0.lock().unwrap(), vec![ItemId(1)]);

        let events = events.0.lock().unwrap();
        let new_chapter_events: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UpdateEvent::NewChapters { entries, .. } => Some(entries),
                _ => None,
            })
            .collect();
        assert_eq!(new_chapter_events.len(), 1);
        assert_eq!(new_chapter_events[0].len(), 1);
        assert_eq!(new_chapter_events[0][0].item.item_id, ItemId(1));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_source_error_grouped_once() {
        let aggregator = OutcomeAggregator::new(
            Uuid::new_v4(),
            AutoDownloadPolicy::default(),
            Arc::new(Downloads::default()),
        );
        for (id, title) in [(1, "Series A"), (2, "Series B")] {
            aggregator.record(
                &LibraryItem::new(id, 1, title),
                "MangaSite",
                UpdateOutcome::Failure(ItemError::Fetch {
                    title: title.into(),
                    source: SourceError::Transport("connection reset".into()),
                }),
            );
        }

        let report = aggregator.finish(summary(false), &Events::default(), None).await;
        assert_eq!(report.failures[0].message, "Transport error: connection reset");
        assert_eq!(report.failures[0].message, report.failures[1].message);

        let text = crate::notifications::FileErrorLog::render(Uuid::nil(), &report.failures);
        assert_eq!(text.matches("! ").count(), 1);
        assert!(text.contains(
            "! Transport error: connection reset\n  # MangaSite\n    - Series A\n    - Series B\n"
        ));
    }

    #[tokio::test]
    async fn test_warnings_do_not_fail_run() {
        let aggregator = OutcomeAggregator::new(
            Uuid::new_v4(),
            AutoDownloadPolicy::default(),
            Arc::new(Downloads::default()),
        );
        aggregator.record(
            &LibraryItem::new(1, 1, "Empty"),
            "One",
            UpdateOutcome::Failure(ItemError::NoNewData),
        );

        let events = Events::default();
        let report = aggregator.finish(summary(false), &events, None).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.hard_failures(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_takes_precedence() {
        let aggregator = OutcomeAggregator::new(
            Uuid::new_v4(),
            AutoDownloadPolicy::default(),
            Arc::new(Downloads::default()),
        );
        aggregator.record(
            &LibraryItem::new(1, 1, "Broken"),
            "One",
            UpdateOutcome::Failure(ItemError::SourceUnavailable(crate::models::SourceId(1))),
        );

        let report = aggregator.finish(summary(true), &Events::default(), None).await;
        assert_eq!(report.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_nothing_to_report_emits_nothing() {
        let aggregator = OutcomeAggregator::new(
            Uuid::new_v4(),
            AutoDownloadPolicy::default(),
            Arc::new(Downloads::default()),
        );
        aggregator.record(&LibraryItem::new(1, 1, "Same"), "One", UpdateOutcome::Success(vec![]));

        let events = Events::default();
        let report = aggregator.finish(summary(false), &events, None).await;

        assert_eq!(report.status, RunStatus::Completed);
        assert!(events.0.lock().unwrap().is_empty());
    }
}
