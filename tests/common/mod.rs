//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use shelf_updater::models::{
    Category, CategoryId, Chapter, ItemId, ItemMetadata, LibraryItem, MergeReference,
    RemoteChapter, RemoteChapterList, SourceId,
};
use shelf_updater::notifications::{DownloadManager, EventSink, NotificationResult, UpdateEvent};
use shelf_updater::scheduler::{ChapterDiff, FetchSchedule};
use shelf_updater::source::{SourceClient, SourceError};
use shelf_updater::storage::{MemoryRepository, Repository, StorageError};

/// Fixed "now" used across tests
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
}

/// Remote chapter list `1..=n`
pub fn remote_chapters(n: usize) -> RemoteChapterList {
    (1..=n)
        .map(|i| RemoteChapter::new(format!("/c/{i}"), format!("Chapter {i}"), i as f64))
        .collect()
}

/// Local copies of remote chapters, fetched at `now()`
pub fn local_chapters(remote: &[RemoteChapter]) -> Vec<Chapter> {
    remote
        .iter()
        .enumerate()
        .map(|(order, r)| Chapter::from_remote(r, order, now()))
        .collect()
}

/// Source with configurable latency that records how it is called
pub struct InstrumentedSource {
    id: SourceId,
    name: String,
    delay: Duration,
    chapters: HashMap<String, RemoteChapterList>,
    failures: HashMap<String, SourceError>,
    panics: HashSet<String>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    global_in_flight: Arc<AtomicUsize>,
    global_peak: Arc<AtomicUsize>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl InstrumentedSource {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id: SourceId(id),
            name: name.to_string(),
            delay: Duration::ZERO,
            chapters: HashMap::new(),
            failures: HashMap::new(),
            panics: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            global_in_flight: Arc::new(AtomicUsize::new(0)),
            global_peak: Arc::new(AtomicUsize::new(0)),
            cancel_after: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_chapters(mut self, url: &str, chapters: RemoteChapterList) -> Self {
        self.chapters.insert(url.to_string(), chapters);
        self
    }

    pub fn with_failure(mut self, url: &str, error: SourceError) -> Self {
        self.failures.insert(url.to_string(), error);
        self
    }

    /// Panic instead of answering for `url`
    pub fn with_panic(mut self, url: &str) -> Self {
        self.panics.insert(url.to_string());
        self
    }

    /// Share in-flight counters with other sources to observe the global bound
    pub fn with_global_counters(mut self, in_flight: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        self.global_in_flight = in_flight;
        self.global_peak = peak;
        self
    }

    /// Cancel `token` when the `n`-th chapter fetch starts
    pub fn cancel_after(&self, n: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((n, token));
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for InstrumentedSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get_details(&self, _item: &LibraryItem) -> Result<ItemMetadata, SourceError> {
        Ok(ItemMetadata::default())
    }

    async fn get_chapters(&self, item: &LibraryItem) -> Result<RemoteChapterList, SourceError> {
        let started = {
            let mut calls = self.calls.lock().unwrap();
            *calls.entry(item.url.clone()).or_default() += 1;
            calls.values().sum::<usize>()
        };
        if let Some((n, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if started >= *n {
                token.cancel();
            }
        }

        let local = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(local, Ordering::SeqCst);
        let global = self.global_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.global_peak.fetch_max(global, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.global_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panics.contains(&item.url) {
            panic!("malformed response for {}", item.url);
        }
        if let Some(error) = self.failures.get(&item.url) {
            return Err(error.clone());
        }
        Ok(self.chapters.get(&item.url).cloned().unwrap_or_default())
    }
}

/// Download manager remembering every request
#[derive(Default)]
pub struct RecordingDownloads {
    pub requests: Mutex<Vec<(ItemId, usize)>>,
}

impl RecordingDownloads {
    pub fn items(&self) -> Vec<ItemId> {
        self.requests.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }
}

impl DownloadManager for RecordingDownloads {
    fn request_download(&self, item: &LibraryItem, chapters: &[Chapter]) {
        self.requests.lock().unwrap().push((item.id, chapters.len()));
    }
}

/// Event sink remembering every event
#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<UpdateEvent>>,
}

impl RecordingEvents {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.as_str()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn emit(&self, event: &UpdateEvent) -> NotificationResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Repository whose library reads can be made to fail
pub struct FlakyRepository {
    pub inner: Arc<MemoryRepository>,
    pub fail_reads: AtomicBool,
}

impl FlakyRepository {
    pub fn new(inner: Arc<MemoryRepository>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(StorageError::Backend("database is locked".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn get_favorite_items(&self) -> Result<Vec<LibraryItem>, StorageError> {
        self.check()?;
        self.inner.get_favorite_items().await
    }

    async fn get_categories(&self) -> Result<Vec<Category>, StorageError> {
        self.check()?;
        self.inner.get_categories().await
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<LibraryItem>, StorageError> {
        self.inner.get_item(id).await
    }

    async fn get_chapters(&self, id: ItemId) -> Result<Vec<Chapter>, StorageError> {
        self.inner.get_chapters(id).await
    }

    async fn get_merge_references(&self, id: ItemId) -> Result<Vec<MergeReference>, StorageError> {
        self.inner.get_merge_references(id).await
    }

    async fn apply_chapter_diff(&self, id: ItemId, diff: &ChapterDiff) -> Result<(), StorageError> {
        self.inner.apply_chapter_diff(id, diff).await
    }

    async fn update_metadata(&self, id: ItemId, metadata: &ItemMetadata) -> Result<(), StorageError> {
        self.inner.update_metadata(id, metadata).await
    }

    async fn update_fetch_schedule(
        &self,
        id: ItemId,
        schedule: &FetchSchedule,
    ) -> Result<(), StorageError> {
        self.inner.update_fetch_schedule(id, schedule).await
    }
}

/// Category helper
pub fn category(id: u64, name: &str) -> Category {
    Category {
        id: CategoryId(id),
        name: name.to_string(),
    }
}
