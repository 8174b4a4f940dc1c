//! Per-item update work
//!
//! [`ItemUpdater`] refreshes one item's chapter list: optional metadata
//! refresh, remote fetch, re-read of the local item, reconciliation and an
//! all-or-nothing write of the diff. Merged items fetch through a separate
//! composite strategy that fans out to every constituent series.
//!
//! Every run target is an [`ItemWork`] implementation so the coordinator
//! drives chapter, cover and tracker runs the same way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::interval::next_schedule;
use super::reconcile::{reconcile, ChapterDiff};
use super::throttle::SourceThrottle;
use super::window::{Clock, FetchWindow};
use crate::models::{Chapter, LibraryItem, RemoteChapterList, SourceId};
use crate::source::{ResolvedSource, SourceCatalog, SourceClient, SourceError, SourceKind, TrackerSync};
use crate::storage::{Repository, StorageError};

/// Failure of a single item. Never aborts the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ItemError {
    /// The source returned an empty chapter list
    #[error("No chapters found")]
    NoNewData,

    /// The item's source is not installed
    #[error("Source not installed: {0}")]
    SourceUnavailable(SourceId),

    /// Transport, HTTP or parse failure from the source client
    #[error("{title}: {source}")]
    Fetch { title: String, source: SourceError },

    /// The repository rejected a read or write
    #[error("{title}: {source}")]
    Storage { title: String, source: StorageError },

    /// No worker slot became free in time
    #[error("Timed out waiting for a worker slot after {waited_secs}s")]
    PoolExhausted { waited_secs: u64 },

    /// The work unit panicked; the rest of the run carries on
    #[error("Update task panicked: {0}")]
    Panicked(String),
}

impl ItemError {
    fn fetch(item: &LibraryItem, source: SourceError) -> Self {
        Self::Fetch {
            title: item.title.clone(),
            source,
        }
    }

    fn storage(item: &LibraryItem, source: StorageError) -> Self {
        Self::Storage {
            title: item.title.clone(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NoNewData => FailureKind::NoNewData,
            Self::SourceUnavailable(_) => FailureKind::SourceUnavailable,
            Self::Fetch { .. } => FailureKind::Fetch,
            Self::Storage { .. } => FailureKind::Storage,
            Self::PoolExhausted { .. } => FailureKind::PoolExhausted,
            Self::Panicked(_) => FailureKind::Panicked,
        }
    }

    /// Failure message without the item title, used to group failures
    pub fn reason(&self) -> String {
        match self {
            Self::Fetch { source, .. } => source.to_string(),
            Self::Storage { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }
}

/// Category of an item failure as surfaced in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoNewData,
    SourceUnavailable,
    Fetch,
    Storage,
    PoolExhausted,
    Panicked,
}

impl FailureKind {
    /// Informational failures that do not mark the run as failed
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::NoNewData)
    }
}

/// Result of one item's work unit
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Chapters inserted by the update, possibly none
    Success(Vec<Chapter>),
    Failure(ItemError),
}

impl From<Result<Vec<Chapter>, ItemError>> for UpdateOutcome {
    fn from(result: Result<Vec<Chapter>, ItemError>) -> Self {
        match result {
            Ok(chapters) => Self::Success(chapters),
            Err(error) => Self::Failure(error),
        }
    }
}

/// Work performed for each selected item of a run
#[async_trait]
pub trait ItemWork: Send + Sync {
    /// Process one item, returning the chapters it inserted
    async fn process(
        &self,
        item: &LibraryItem,
        source: &ResolvedSource,
    ) -> Result<Vec<Chapter>, ItemError>;
}

/// How remote chapters are obtained for one item
enum FetchStrategy<'a> {
    Direct(&'a Arc<dyn SourceClient>),
    Composite,
}

impl<'a> FetchStrategy<'a> {
    fn for_source(source: &'a ResolvedSource) -> Self {
        match &source.kind {
            SourceKind::Plain(client) | SourceKind::Throttled { client, .. } => Self::Direct(client),
            SourceKind::Composite(_) => Self::Composite,
        }
    }
}

/// Refreshes a single item against its source
pub struct ItemUpdater {
    repo: Arc<dyn Repository>,
    catalog: Arc<SourceCatalog>,
    throttle: Arc<SourceThrottle>,
    clock: Arc<dyn Clock>,
    window: FetchWindow,
    refresh_metadata: bool,
}

impl ItemUpdater {
    pub fn new(
        repo: Arc<dyn Repository>,
        catalog: Arc<SourceCatalog>,
        throttle: Arc<SourceThrottle>,
        clock: Arc<dyn Clock>,
        window: FetchWindow,
    ) -> Self {
        Self {
            repo,
            catalog,
            throttle,
            clock,
            window,
            refresh_metadata: false,
        }
    }

    /// Refresh title, cover and status before fetching chapters
    pub fn with_metadata_refresh(mut self, enabled: bool) -> Self {
        self.refresh_metadata = enabled;
        self
    }

    /// Update one item and return the persisted diff
    pub async fn update(
        &self,
        item: &LibraryItem,
        source: &ResolvedSource,
    ) -> Result<ChapterDiff, ItemError> {
        if self.refresh_metadata {
            self.refresh_metadata(item, source).await?;
        }

        let remote_lists = match FetchStrategy::for_source(source) {
            FetchStrategy::Direct(client) => vec![client
                .get_chapters(item)
                .await
                .map_err(|e| ItemError::fetch(item, e))?],
            FetchStrategy::Composite => self.fetch_constituents(item).await?,
        };

        if remote_lists.iter().all(Vec::is_empty) {
            return Err(ItemError::NoNewData);
        }

        let fetched_at = self.clock.now();

        // The user may have changed the item while we were fetching.
        let current = match self.repo.get_item(item.id).await {
            Ok(Some(current)) if current.favorite => current,
            Ok(_) => {
                debug!(item_id = %item.id, title = %item.title, "Item left the library during update");
                return Ok(ChapterDiff::empty(fetched_at));
            }
            Err(e) => return Err(ItemError::storage(item, e)),
        };

        let local = self
            .repo
            .get_chapters(item.id)
            .await
            .map_err(|e| ItemError::storage(item, e))?;

        // Constituents are concatenated in reference order so every chapter
        // of a merged item gets a distinct source order.
        let remote: RemoteChapterList = remote_lists.into_iter().flatten().collect();
        let diff = reconcile(&local, &remote, fetched_at);

        if !diff.is_empty() {
            self.repo
                .apply_chapter_diff(item.id, &diff)
                .await
                .map_err(|e| ItemError::storage(item, e))?;
        }

        self.update_schedule(&current).await;

        debug!(
            item_id = %item.id,
            inserted = diff.inserted.len(),
            updated = diff.updated.len(),
            unchanged = diff.unchanged,
            "Item reconciled"
        );

        Ok(diff)
    }

    async fn fetch_constituents(&self, item: &LibraryItem) -> Result<Vec<RemoteChapterList>, ItemError> {
        let references = self
            .repo
            .get_merge_references(item.id)
            .await
            .map_err(|e| ItemError::storage(item, e))?;

        let mut lists = Vec::with_capacity(references.len());
        for reference in references {
            let (client, proxy) = self.constituent(item, reference.source, &reference.url)?;
            self.throttle.acquire(reference.source).await;
            let chapters = client
                .get_chapters(&proxy)
                .await
                .map_err(|e| ItemError::fetch(item, e))?;
            lists.push(chapters);
        }
        Ok(lists)
    }

    /// Client of a constituent series with an item pointing at it
    fn constituent(
        &self,
        item: &LibraryItem,
        source: SourceId,
        url: &str,
    ) -> Result<(Arc<dyn SourceClient>, LibraryItem), ItemError> {
        let client = self
            .catalog
            .resolve(source)
            .and_then(|resolved| resolved.client().cloned())
            .ok_or(ItemError::SourceUnavailable(source))?;

        let mut proxy = item.clone();
        proxy.source = source;
        proxy.url = url.to_string();
        Ok((client, proxy))
    }

    /// Refresh title, cover and status from the source
    pub async fn refresh_metadata(
        &self,
        item: &LibraryItem,
        source: &ResolvedSource,
    ) -> Result<(), ItemError> {
        let details = match FetchStrategy::for_source(source) {
            FetchStrategy::Direct(client) => client.get_details(item).await,
            FetchStrategy::Composite => {
                let references = self
                    .repo
                    .get_merge_references(item.id)
                    .await
                    .map_err(|e| ItemError::storage(item, e))?;
                let Some(first) = references.first() else {
                    return Ok(());
                };
                let (client, proxy) = self.constituent(item, first.source, &first.url)?;
                self.throttle.acquire(first.source).await;
                client.get_details(&proxy).await
            }
        }
        .map_err(|e| ItemError::fetch(item, e))?;

        self.repo
            .update_metadata(item.id, &details)
            .await
            .map_err(|e| ItemError::storage(item, e))
    }

    async fn update_schedule(&self, item: &LibraryItem) {
        let (updated, chapters) = match (
            self.repo.get_item(item.id).await,
            self.repo.get_chapters(item.id).await,
        ) {
            (Ok(Some(updated)), Ok(chapters)) => (updated, chapters),
            _ => return,
        };

        if let Some(schedule) = next_schedule(&updated, &chapters, self.clock.now(), &self.window) {
            if let Err(e) = self.repo.update_fetch_schedule(item.id, &schedule).await {
                warn!(item_id = %item.id, error = %e, "Failed to store fetch schedule");
            }
        }
    }
}

#[async_trait]
impl ItemWork for ItemUpdater {
    async fn process(
        &self,
        item: &LibraryItem,
        source: &ResolvedSource,
    ) -> Result<Vec<Chapter>, ItemError> {
        self.update(item, source).await.map(|diff| diff.inserted)
    }
}

/// Metadata-only work for cover runs
pub struct CoverWork {
    updater: ItemUpdater,
}

impl CoverWork {
    pub fn new(updater: ItemUpdater) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl ItemWork for CoverWork {
    async fn process(
        &self,
        item: &LibraryItem,
        source: &ResolvedSource,
    ) -> Result<Vec<Chapter>, ItemError> {
        self.updater.refresh_metadata(item, source).await?;
        Ok(Vec::new())
    }
}

/// Tracker synchronisation work for tracking runs
pub struct TrackingWork {
    tracker: Arc<dyn TrackerSync>,
}

impl TrackingWork {
    pub fn new(tracker: Arc<dyn TrackerSync>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl ItemWork for TrackingWork {
    async fn process(
        &self,
        item: &LibraryItem,
        _source: &ResolvedSource,
    ) -> Result<Vec<Chapter>, ItemError> {
        self.tracker
            .refresh(item)
            .await
            .map_err(|e| ItemError::fetch(item, e))?;
        Ok(Vec::new())
    }
}
