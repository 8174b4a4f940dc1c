//! Repository Pattern for library persistence
//!
//! The scheduler reads and writes the library only through [`Repository`],
//! so the storage engine stays outside this crate.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Library update scheduler                    │
//! │        (selection, item updater, fetch interval)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Repository trait                        │
//! └─────────────────────────────────────────────────────────────┘
//!                   │                          │
//!                   ▼                          ▼
//!        ┌─────────────────────┐    ┌─────────────────────┐
//!        │   App database      │    │  MemoryRepository   │
//!        │  (external crate)   │    │  (tests, snapshots) │
//!        └─────────────────────┘    └─────────────────────┘
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{Category, Chapter, ItemId, ItemMetadata, LibraryItem, MergeReference};
use crate::scheduler::interval::FetchSchedule;
use crate::scheduler::reconcile::ChapterDiff;

/// Errors raised by a repository implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The item does not exist
    #[error("Item {0} not found")]
    ItemNotFound(ItemId),

    /// Backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Library persistence consumed by the scheduler
#[async_trait]
pub trait Repository: Send + Sync {
    /// All favorited items
    async fn get_favorite_items(&self) -> Result<Vec<LibraryItem>, StorageError>;

    /// All user categories
    async fn get_categories(&self) -> Result<Vec<Category>, StorageError>;

    /// Current state of one item
    async fn get_item(&self, id: ItemId) -> Result<Option<LibraryItem>, StorageError>;

    /// Locally stored chapters of one item
    async fn get_chapters(&self, id: ItemId) -> Result<Vec<Chapter>, StorageError>;

    /// Constituent series of a merged item
    async fn get_merge_references(&self, id: ItemId) -> Result<Vec<MergeReference>, StorageError>;

    /// Persist a reconciled chapter diff. Must be all-or-nothing.
    async fn apply_chapter_diff(&self, id: ItemId, diff: &ChapterDiff) -> Result<(), StorageError>;

    /// Persist refreshed metadata
    async fn update_metadata(&self, id: ItemId, metadata: &ItemMetadata) -> Result<(), StorageError>;

    /// Persist the recomputed fetch interval and next update
    async fn update_fetch_schedule(
        &self,
        id: ItemId,
        schedule: &FetchSchedule,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<ItemId, LibraryItem>,
    chapters: HashMap<ItemId, Vec<Chapter>>,
    categories: Vec<Category>,
    merges: HashMap<ItemId, Vec<MergeReference>>,
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
}

impl MemoryRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item with its local chapters
    pub async fn insert_item(&self, mut item: LibraryItem, chapters: Vec<Chapter>) {
        item.refresh_counters(&chapters);
        let mut state = self.state.write().await;
        state.chapters.insert(item.id, chapters);
        state.items.insert(item.id, item);
    }

    /// Add an item keeping its stored counters untouched
    pub async fn insert_item_raw(&self, item: LibraryItem, chapters: Vec<Chapter>) {
        let mut state = self.state.write().await;
        state.chapters.insert(item.id, chapters);
        state.items.insert(item.id, item);
    }

    pub async fn insert_category(&self, category: Category) {
        self.state.write().await.categories.push(category);
    }

    pub async fn set_merge_references(&self, id: ItemId, references: Vec<MergeReference>) {
        self.state.write().await.merges.insert(id, references);
    }

    /// Toggle the favorite flag, as a user would mid-run
    pub async fn set_favorite(&self, id: ItemId, favorite: bool) {
        if let Some(item) = self.state.write().await.items.get_mut(&id) {
            item.favorite = favorite;
        }
    }

    /// Every stored item, favorited or not
    pub async fn all_items(&self) -> Vec<LibraryItem> {
        let mut items: Vec<_> = self.state.read().await.items.values().cloned().collect();
        items.sort_by_key(|item| item.id);
        items
    }

    pub async fn chapter_count(&self, id: ItemId) -> usize {
        self.state
            .read()
            .await
            .chapters
            .get(&id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_favorite_items(&self) -> Result<Vec<LibraryItem>, StorageError> {
        let state = self.state.read().await;
        let mut items: Vec<_> = state
            .items
            .values()
            .filter(|item| item.favorite)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn get_categories(&self) -> Result<Vec<Category>, StorageError> {
        Ok(self.state.read().await.categories.clone())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<LibraryItem>, StorageError> {
        Ok(self.state.read().await.items.get(&id).cloned())
    }

    async fn get_chapters(&self, id: ItemId) -> Result<Vec<Chapter>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .chapters
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_merge_references(&self, id: ItemId) -> Result<Vec<MergeReference>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .merges
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_chapter_diff(&self, id: ItemId, diff: &ChapterDiff) -> Result<(), StorageError> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let item = state.items.get_mut(&id).ok_or(StorageError::ItemNotFound(id))?;
        let chapters = state.chapters.entry(id).or_default();

        for updated in &diff.updated {
            if let Some(local) = chapters.iter_mut().find(|c| c.url == updated.url) {
                local.name = updated.name.clone();
                local.chapter_number = updated.chapter_number;
                local.date_upload = updated.date_upload;
                local.scanlator = updated.scanlator.clone();
                local.source_order = updated.source_order;
            }
        }

        for inserted in &diff.inserted {
            if !chapters.iter().any(|c| c.url == inserted.url) {
                chapters.push(inserted.clone());
            }
        }

        item.refresh_counters(chapters);
        if !diff.inserted.is_empty() {
            item.last_update = Some(diff.fetched_at);
        }

        Ok(())
    }

    async fn update_metadata(&self, id: ItemId, metadata: &ItemMetadata) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let item = state.items.get_mut(&id).ok_or(StorageError::ItemNotFound(id))?;

        if let Some(title) = metadata.title.as_ref().filter(|t| !t.is_empty()) {
            item.title = title.clone();
        }
        if let Some(thumbnail) = &metadata.thumbnail_url {
            item.thumbnail_url = Some(thumbnail.clone());
        }
        if let Some(status) = metadata.status {
            item.status = status;
        }

        Ok(())
    }

    async fn update_fetch_schedule(
        &self,
        id: ItemId,
        schedule: &FetchSchedule,
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let item = state.items.get_mut(&id).ok_or(StorageError::ItemNotFound(id))?;
        item.fetch_interval_days = schedule.interval_days;
        item.next_update = Some(schedule.next_update);
        Ok(())
    }
}
