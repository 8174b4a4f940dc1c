//! Run lifecycle and the update entry point
//!
//! [`UpdateJob::start_run`] registers the run's scope, spawns the run task
//! and returns a [`RunHandle`]. The run moves through
//!
//! ```text
//! Idle ─► Selecting ─► Running ─► (Cancelling) ─► Completed
//! ```
//!
//! and always reaches `Completed`: rejection, selection failure,
//! cancellation and normal completion all end with a [`RunReport`], a call
//! to [`ProgressReporter::on_completed`] and the release of the scope.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregator::{OutcomeAggregator, RunReport, RunStatus, RunSummary};
use super::coordinator::ConcurrencyCoordinator;
use super::error::{SchedulerError, SchedulerResult};
use super::progress::{NoopReporter, ProgressReporter, ProgressTracker};
use super::registry::{ActiveRun, RunGuard, RunRegistry};
use super::selection::{select, validate_scope, Selection, UpdateScope, UpdateTarget};
use super::throttle::SourceThrottle;
use super::updater::{CoverWork, ItemUpdater, ItemWork, TrackingWork};
use super::window::{Clock, FetchWindow, SystemClock};
use crate::config::{Config, RunConfiguration};
use crate::error::{Error, UpdaterErrorTrait};
use crate::metrics;
use crate::notifications::{DownloadManager, ErrorLogWriter, EventSink, NoopDownloads, TracingEventSink};
use crate::source::{SourceCatalog, TrackerSync};
use crate::storage::Repository;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Selecting,
    Running,
    Cancelling,
    Completed,
}

/// Collaborators shared by every run of a job
#[derive(Clone)]
struct JobContext {
    repo: Arc<dyn Repository>,
    catalog: Arc<SourceCatalog>,
    throttle: Arc<SourceThrottle>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ProgressReporter>,
    events: Arc<dyn EventSink>,
    downloads: Arc<dyn DownloadManager>,
    error_log: Option<Arc<dyn ErrorLogWriter>>,
    tracker: Option<Arc<dyn TrackerSync>>,
}

/// Everything a run needs once candidates are known
struct Prepared {
    config: RunConfiguration,
    selection: Selection,
    work: Arc<dyn ItemWork>,
}

impl JobContext {
    async fn prepare(&self, scope: UpdateScope, target: UpdateTarget) -> SchedulerResult<Prepared> {
        let window = FetchWindow::around(self.clock.now());
        let config = self.config.run_configuration(scope, target, window);

        let updater = ItemUpdater::new(
            self.repo.clone(),
            self.catalog.clone(),
            self.throttle.clone(),
            self.clock.clone(),
            window,
        )
        .with_metadata_refresh(config.refresh_metadata);

        let work: Arc<dyn ItemWork> = match target {
            UpdateTarget::Chapters => Arc::new(updater),
            UpdateTarget::Covers => Arc::new(CoverWork::new(updater)),
            UpdateTarget::Tracking => match &self.tracker {
                Some(tracker) => Arc::new(TrackingWork::new(tracker.clone())),
                None => return Err(SchedulerError::TrackerUnavailable),
            },
        };

        let categories = self.repo.get_categories().await?;
        validate_scope(&scope, &categories)?;

        let items = self.repo.get_favorite_items().await?;
        let selection = select(&config, &items);

        Ok(Prepared {
            config,
            selection,
            work,
        })
    }
}

/// Entry point for library update runs
pub struct UpdateJob {
    ctx: JobContext,
    registry: RunRegistry,
}

impl UpdateJob {
    /// Start building a job over a repository and a set of sources
    pub fn builder(repo: Arc<dyn Repository>, catalog: SourceCatalog) -> UpdateJobBuilder {
        UpdateJobBuilder {
            repo,
            catalog,
            config: Config::default(),
            clock: Arc::new(SystemClock),
            reporter: Arc::new(NoopReporter),
            events: Arc::new(TracingEventSink),
            downloads: Arc::new(NoopDownloads),
            error_log: None,
            tracker: None,
            registry: None,
        }
    }

    /// Start a run unless one with an overlapping scope is active
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_run(&self, scope: UpdateScope, target: UpdateTarget) -> RunHandle {
        let run_id = Uuid::new_v4();
        let started_at = self.ctx.clock.now();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(RunState::Idle);
        let state_tx = Arc::new(state_tx);

        let guard = match self.registry.try_register(ActiveRun {
            run_id,
            scope,
            target,
            started_at,
        }) {
            Ok(guard) => guard,
            Err(existing) => {
                info!(
                    run_id = %run_id,
                    scope = %scope,
                    active_run = %existing.run_id,
                    "Library update rejected, overlapping run active"
                );
                let report = RunReport::empty(
                    run_id,
                    scope,
                    target,
                    RunStatus::RejectedAlreadyRunning,
                    started_at,
                );
                state_tx.send_replace(RunState::Completed);
                self.ctx.reporter.on_completed(&report);
                metrics::record_run(report.status.as_str(), &target.to_string(), 0.0);
                return RunHandle {
                    run_id,
                    cancel,
                    state: state_rx,
                    state_tx,
                    completion: Completion::Ready(Box::new(report)),
                };
            }
        };

        let run = Run {
            ctx: self.ctx.clone(),
            run_id,
            scope,
            target,
            started_at,
            cancel: cancel.clone(),
            state: state_tx.clone(),
            _guard: guard,
        };

        RunHandle {
            run_id,
            cancel,
            state: state_rx,
            state_tx,
            completion: Completion::Pending(tokio::spawn(run.execute())),
        }
    }

    /// Compute the selection a run would use, without running it
    pub async fn preview(&self, scope: UpdateScope, target: UpdateTarget) -> SchedulerResult<Selection> {
        self.ctx.prepare(scope, target).await.map(|p| p.selection)
    }

    /// Whether an active run overlaps `scope`
    pub fn is_running(&self, scope: &UpdateScope) -> bool {
        self.registry.is_running(scope)
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn throttle(&self) -> &SourceThrottle {
        &self.ctx.throttle
    }
}

/// Builder for [`UpdateJob`]
pub struct UpdateJobBuilder {
    repo: Arc<dyn Repository>,
    catalog: SourceCatalog,
    config: Config,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn ProgressReporter>,
    events: Arc<dyn EventSink>,
    downloads: Arc<dyn DownloadManager>,
    error_log: Option<Arc<dyn ErrorLogWriter>>,
    tracker: Option<Arc<dyn TrackerSync>>,
    registry: Option<RunRegistry>,
}

impl UpdateJobBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn downloads(mut self, downloads: Arc<dyn DownloadManager>) -> Self {
        self.downloads = downloads;
        self
    }

    pub fn error_log(mut self, writer: Arc<dyn ErrorLogWriter>) -> Self {
        self.error_log = Some(writer);
        self
    }

    pub fn tracker(mut self, tracker: Arc<dyn TrackerSync>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Share a registry with other jobs, e.g. automatic and manual updates
    pub fn registry(mut self, registry: RunRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> UpdateJob {
        // Configured policies override the ones sources ship with.
        let throttle = SourceThrottle::with_policies(self.catalog.throttle_policies());
        for (source, policy) in self.config.throttle_policies() {
            throttle.set_policy(source, &policy);
        }

        UpdateJob {
            ctx: JobContext {
                repo: self.repo,
                catalog: Arc::new(self.catalog),
                throttle: Arc::new(throttle),
                config: Arc::new(self.config),
                clock: self.clock,
                reporter: self.reporter,
                events: self.events,
                downloads: self.downloads,
                error_log: self.error_log,
                tracker: self.tracker,
            },
            registry: self.registry.unwrap_or_default(),
        }
    }
}

enum Completion {
    Ready(Box<RunReport>),
    Pending(JoinHandle<RunReport>),
}

/// Handle to a started run
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    state_tx: Arc<watch::Sender<RunState>>,
    completion: Completion,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.run_id
    }

    /// Stop starting new items. Items in flight finish normally.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state_tx.send_if_modified(|state| match state {
            RunState::Selecting | RunState::Running => {
                *state = RunState::Cancelling;
                true
            }
            _ => false,
        });
    }

    /// Token cancelled by [`RunHandle::cancel`]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver observing state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Wait for the run to complete
    pub async fn wait(self) -> SchedulerResult<RunReport> {
        match self.completion {
            Completion::Ready(report) => Ok(*report),
            Completion::Pending(handle) => handle
                .await
                .map_err(|e| SchedulerError::run_failed(e.to_string())),
        }
    }
}

/// One spawned run
struct Run {
    ctx: JobContext,
    run_id: Uuid,
    scope: UpdateScope,
    target: UpdateTarget,
    started_at: chrono::DateTime<chrono::Utc>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RunState>>,
    _guard: RunGuard,
}

impl Run {
    fn enter(&self, next: RunState) {
        self.state.send_if_modified(|state| {
            let allowed = match next {
                RunState::Selecting => *state == RunState::Idle,
                RunState::Running => *state == RunState::Selecting,
                _ => true,
            };
            if allowed && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    async fn execute(self) -> RunReport {
        self.enter(RunState::Selecting);
        debug!(run_id = %self.run_id, scope = %self.scope, target = %self.target, "Selecting candidates");

        let report = match self.ctx.prepare(self.scope, self.target).await {
            Err(e) => {
                let mut report = RunReport::empty(
                    self.run_id,
                    self.scope,
                    self.target,
                    RunStatus::Aborted,
                    self.started_at,
                );
                report.abort_reason = Some(e.to_string());
                let error = Error::from(e);
                report.abort_category = Some(error.category());
                report.abort_retryable = error.is_recoverable();
                warn!(
                    run_id = %self.run_id,
                    category = %error.category(),
                    retryable = report.abort_retryable,
                    error = %error,
                    "Library update aborted"
                );
                report.finished_at = self.ctx.clock.now();
                report
            }
            Ok(prepared) if self.cancel.is_cancelled() => {
                let mut report = RunReport::empty(
                    self.run_id,
                    self.scope,
                    self.target,
                    RunStatus::Cancelled,
                    self.started_at,
                );
                report.skipped = prepared.selection.excluded;
                report.finished_at = self.ctx.clock.now();
                report
            }
            Ok(prepared) => self.run_items(prepared).await,
        };

        self.enter(RunState::Completed);
        self.ctx.reporter.on_completed(&report);

        let elapsed = (report.finished_at - report.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        metrics::record_run(report.status.as_str(), &self.target.to_string(), elapsed);

        info!(
            run_id = %self.run_id,
            status = %report.status,
            attempted = report.attempted,
            new_chapters = report.new_chapter_count(),
            failures = report.failures.len(),
            skipped = report.skipped.len(),
            "Library update completed"
        );

        report
    }

    async fn run_items(&self, prepared: Prepared) -> RunReport {
        let Prepared {
            config,
            selection,
            work,
        } = prepared;

        self.enter(RunState::Running);
        info!(
            run_id = %self.run_id,
            scope = %self.scope,
            target = %self.target,
            selected = selection.selected.len(),
            skipped = selection.excluded.len(),
            "Starting library update"
        );
        for excluded in &selection.excluded {
            debug!(run_id = %self.run_id, item_id = %excluded.item_id, reason = %excluded.reason, "Item skipped");
        }

        let aggregator = Arc::new(OutcomeAggregator::new(
            self.run_id,
            config.auto_download.clone(),
            self.ctx.downloads.clone(),
        ));
        let progress = Arc::new(ProgressTracker::new(
            self.ctx.reporter.clone(),
            selection.selected.len(),
        ));

        ConcurrencyCoordinator::new(self.ctx.catalog.clone(), self.ctx.throttle.clone())
            .with_limits(config.global_concurrency, config.per_source_concurrency)
            .with_slot_timeout(config.slot_timeout)
            .run(
                selection.selected,
                work,
                aggregator.clone(),
                progress,
                self.cancel.clone(),
            )
            .await;

        let summary = RunSummary {
            scope: self.scope,
            target: self.target,
            started_at: self.started_at,
            finished_at: self.ctx.clock.now(),
            cancelled: self.cancel.is_cancelled(),
            skipped: selection.excluded,
        };

        aggregator
            .finish(summary, self.ctx.events.as_ref(), self.ctx.error_log.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::models::{CategoryId, LibraryItem, RemoteChapter, SourceId};
    use crate::source::ReplaySource;
    use crate::storage::MemoryRepository;

    async fn library() -> (Arc<MemoryRepository>, SourceCatalog) {
        let repo = Arc::new(MemoryRepository::new());
        let item = LibraryItem::new(1, 1, "One");
        repo.insert_item(item.clone(), vec![]).await;

        let mut catalog = SourceCatalog::new();
        catalog.register(Arc::new(ReplaySource::new(SourceId(1), "Replay").with_chapters(
            item.url.clone(),
            vec![RemoteChapter::new("/c/1", "Chapter 1", 1.0)],
        )));
        (repo, catalog)
    }

    #[tokio::test]
    async fn test_run_reaches_completed() {
        let (repo, catalog) = library().await;
        let job = UpdateJob::builder(repo, catalog).build();

        let handle = job.start_run(UpdateScope::Library, UpdateTarget::Chapters);
        let state = handle.subscribe();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.succeeded_with_new.len(), 1);
        assert_eq!(*state.borrow(), RunState::Completed);
        assert!(!job.is_running(&UpdateScope::Library));
    }

    #[tokio::test]
    async fn test_unknown_category_aborts() {
        let (repo, catalog) = library().await;
        let job = UpdateJob::builder(repo, catalog).build();

        let report = job
            .start_run(UpdateScope::Category(CategoryId(9)), UpdateTarget::Chapters)
            .wait()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.attempted, 0);
        assert_eq!(report.abort_category, Some(ErrorCategory::Scheduler));
        assert!(!report.abort_retryable);
        assert!(report.abort_reason.unwrap().contains('9'));
    }

    #[tokio::test]
    async fn test_tracking_without_tracker_aborts() {
        let (repo, catalog) = library().await;
        let job = UpdateJob::builder(repo, catalog).build();

        let report = job
            .start_run(UpdateScope::Library, UpdateTarget::Tracking)
            .wait()
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_before_selection_finishes() {
        let (repo, catalog) = library().await;
        let job = UpdateJob::builder(repo.clone(), catalog).build();

        let handle = job.start_run(UpdateScope::Library, UpdateTarget::Chapters);
        handle.cancel();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.attempted, 0);
        assert_eq!(repo.chapter_count(crate::models::ItemId(1)).await, 0);
    }

    #[tokio::test]
    async fn test_preview_does_not_register() {
        let (repo, catalog) = library().await;
        let job = UpdateJob::builder(repo, catalog).build();

        let selection = job
            .preview(UpdateScope::Library, UpdateTarget::Chapters)
            .await
            .unwrap();
        assert_eq!(selection.selected.len(), 1);
        assert!(job.registry().active().is_empty());
    }
}
