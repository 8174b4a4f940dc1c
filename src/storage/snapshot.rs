//! JSON library snapshots
//!
//! A snapshot captures a library (items, local chapters, categories) together
//! with the remote chapter lists each source would return. The CLI replays a
//! snapshot to preview a selection or to run a full offline update.
//!
//! ```json
//! {
//!   "categories": [{ "id": 1, "name": "Reading" }],
//!   "sources": [{ "id": 10, "name": "MangaSite", "throttle": null }],
//!   "items": [{
//!     "id": 1, "source": 10, "url": "/series/1", "title": "Example",
//!     "chapters": [],
//!     "remote": [{ "url": "/c/1", "name": "Chapter 1", "chapter_number": 1.0 }]
//!   }]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::repository::{MemoryRepository, Repository};
use crate::models::{
    Category, Chapter, ItemMetadata, LibraryItem, MergeReference, RemoteChapterList, SourceId,
};
use crate::scheduler::throttle::ThrottlePolicy;
use crate::source::{ReplaySource, SourceCatalog};

/// Source entry of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSource {
    pub id: SourceId,
    pub name: String,

    /// Merged source whose items point at constituent series
    #[serde(default)]
    pub composite: bool,

    #[serde(default)]
    pub throttle: Option<ThrottlePolicy>,

    /// Chapter lists of series only reachable through merge references
    #[serde(default)]
    pub series: HashMap<String, RemoteChapterList>,
}

/// Item entry of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotItem {
    #[serde(flatten)]
    pub item: LibraryItem,

    #[serde(default)]
    pub chapters: Vec<Chapter>,

    /// Chapter list the item's source returns, `None` when the source has nothing
    #[serde(default)]
    pub remote: Option<RemoteChapterList>,

    #[serde(default)]
    pub details: Option<ItemMetadata>,

    #[serde(default)]
    pub merge_references: Vec<MergeReference>,
}

/// A whole library with recorded remote state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrarySnapshot {
    #[serde(default)]
    pub categories: Vec<Category>,

    #[serde(default)]
    pub sources: Vec<SnapshotSource>,

    #[serde(default)]
    pub items: Vec<SnapshotItem>,
}

impl LibrarySnapshot {
    /// Load a snapshot from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot file: {}", path.display()))
    }

    /// Write the snapshot as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize snapshot")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write snapshot file: {}", path.display()))
    }

    /// Build the repository and the replay sources described by the snapshot
    pub async fn load(&self) -> (Arc<MemoryRepository>, SourceCatalog) {
        let repo = MemoryRepository::new();
        for category in &self.categories {
            repo.insert_category(category.clone()).await;
        }

        let mut replays: HashMap<SourceId, ReplaySource> = self
            .sources
            .iter()
            .filter(|s| !s.composite)
            .map(|s| {
                let mut replay = ReplaySource::new(s.id, s.name.clone());
                for (url, chapters) in &s.series {
                    replay.insert_chapters(url.clone(), chapters.clone());
                }
                (s.id, replay)
            })
            .collect();

        for entry in &self.items {
            if entry.chapters.is_empty() {
                repo.insert_item_raw(entry.item.clone(), Vec::new()).await;
            } else {
                repo.insert_item(entry.item.clone(), entry.chapters.clone()).await;
            }

            if !entry.merge_references.is_empty() {
                repo.set_merge_references(entry.item.id, entry.merge_references.clone())
                    .await;
            }

            let replay = replays
                .entry(entry.item.source)
                .or_insert_with(|| ReplaySource::new(entry.item.source, entry.item.source.to_string()));
            if let Some(remote) = &entry.remote {
                replay.insert_chapters(entry.item.url.clone(), remote.clone());
            }
            if let Some(details) = &entry.details {
                replay.insert_details(entry.item.url.clone(), details.clone());
            }
        }

        let mut catalog = SourceCatalog::new();
        for source in &self.sources {
            if source.composite {
                catalog.register_composite(source.id, source.name.clone());
            }
        }
        for (id, replay) in replays {
            let declared = self.sources.iter().find(|s| s.id == id);
            if declared.is_some_and(|s| s.composite) {
                continue;
            }
            let throttle = declared
                .and_then(|s| s.throttle.clone())
                .unwrap_or(ThrottlePolicy::Unlimited);
            catalog.register_throttled(Arc::new(replay), throttle);
        }

        (Arc::new(repo), catalog)
    }

    /// Copy item and chapter state back from a repository after a run
    pub async fn refresh_from(&mut self, repo: &MemoryRepository) -> Result<()> {
        for entry in &mut self.items {
            if let Some(item) = repo.get_item(entry.item.id).await? {
                entry.item = item;
            }
            entry.chapters = repo.get_chapters(entry.item.id).await?;
        }
        Ok(())
    }
}
