// Core data structures for the library update scheduler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable identifier of a library item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a remote source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub u64);

impl CategoryId {
    /// Implicit category of items the user never categorized
    pub const DEFAULT: CategoryId = CategoryId(0);
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
}

/// How an item takes part in library updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Refreshed on every library update
    #[default]
    Always,
    /// Fetched once when added, never refreshed by library updates
    OnlyFetchOnce,
}

/// Publication status reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Unknown,
    Ongoing,
    Completed,
    Licensed,
    PublishingFinished,
    Cancelled,
    OnHiatus,
}

impl ItemStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Licensed => "licensed",
            Self::PublishingFinished => "publishing_finished",
            Self::Cancelled => "cancelled",
            Self::OnHiatus => "on_hiatus",
        }
    }

    /// Create from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "ongoing" => Some(Self::Ongoing),
            "completed" => Some(Self::Completed),
            "licensed" => Some(Self::Licensed),
            "publishing_finished" => Some(Self::PublishingFinished),
            "cancelled" => Some(Self::Cancelled),
            "on_hiatus" => Some(Self::OnHiatus),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tracked series in the user's library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryItem {
    pub id: ItemId,
    pub source: SourceId,
    /// Source-relative url of the series
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default = "default_favorite")]
    pub favorite: bool,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    /// Number of chapters stored locally
    #[serde(default)]
    pub total_chapters: u32,
    #[serde(default)]
    pub unread_count: u32,
    /// At least one chapter has been read
    #[serde(default)]
    pub has_started: bool,
    #[serde(default)]
    pub categories: BTreeSet<CategoryId>,
    /// Whether any tracker service is bound to this item
    #[serde(default)]
    pub tracked: bool,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_update: Option<DateTime<Utc>>,
    /// Days between expected releases. 0 = not computed yet, negative = set manually.
    #[serde(default)]
    pub fetch_interval_days: i32,
}

fn default_favorite() -> bool {
    true
}

impl LibraryItem {
    /// Create a favorited item with empty local state
    pub fn new(id: i64, source: u64, title: impl Into<String>) -> Self {
        Self {
            id: ItemId(id),
            source: SourceId(source),
            url: format!("/series/{id}"),
            title: title.into(),
            status: ItemStatus::Unknown,
            update_strategy: UpdateStrategy::Always,
            favorite: true,
            thumbnail_url: None,
            total_chapters: 0,
            unread_count: 0,
            has_started: false,
            categories: BTreeSet::new(),
            tracked: false,
            last_update: None,
            next_update: None,
            fetch_interval_days: 0,
        }
    }

    pub fn has_unread(&self) -> bool {
        self.unread_count > 0
    }

    /// Categories the item belongs to, with uncategorized items in the default category
    pub fn effective_categories(&self) -> BTreeSet<CategoryId> {
        if self.categories.is_empty() {
            BTreeSet::from([CategoryId::DEFAULT])
        } else {
            self.categories.clone()
        }
    }

    /// Recompute the derived counters from a full chapter set
    pub fn refresh_counters(&mut self, chapters: &[Chapter]) {
        self.total_chapters = chapters.len() as u32;
        self.unread_count = chapters.iter().filter(|c| !c.read).count() as u32;
        self.has_started = chapters.iter().any(|c| c.read || c.last_page_read > 0);
    }
}

/// Chapter descriptor returned by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChapter {
    pub url: String,
    pub name: String,
    /// Negative when the source could not determine a number
    #[serde(default = "unknown_chapter_number")]
    pub chapter_number: f64,
    #[serde(default)]
    pub date_upload: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scanlator: Option<String>,
}

fn unknown_chapter_number() -> f64 {
    -1.0
}

impl RemoteChapter {
    pub fn new(url: impl Into<String>, name: impl Into<String>, chapter_number: f64) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            chapter_number,
            date_upload: None,
            scanlator: None,
        }
    }
}

/// Chapter list in source order (display order, not sorted by number)
pub type RemoteChapterList = Vec<RemoteChapter>;

/// Locally stored chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub url: String,
    pub name: String,
    pub chapter_number: f64,
    #[serde(default)]
    pub date_upload: Option<DateTime<Utc>>,
    pub date_fetch: DateTime<Utc>,
    #[serde(default)]
    pub scanlator: Option<String>,
    /// Position in the source's list
    #[serde(default)]
    pub source_order: usize,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub bookmark: bool,
    #[serde(default)]
    pub last_page_read: u32,
}

impl Chapter {
    /// Build an unread chapter from its remote descriptor
    pub fn from_remote(remote: &RemoteChapter, source_order: usize, date_fetch: DateTime<Utc>) -> Self {
        Self {
            url: remote.url.clone(),
            name: remote.name.clone(),
            chapter_number: remote.chapter_number,
            date_upload: remote.date_upload,
            date_fetch,
            scanlator: remote.scanlator.clone(),
            source_order,
            read: false,
            bookmark: false,
            last_page_read: 0,
        }
    }
}

/// Descriptive metadata refreshed from a source
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub status: Option<ItemStatus>,
}

/// Link from a merged item to one of its constituent series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReference {
    pub source: SourceId,
    pub url: String,
}
