//! Remote/local chapter reconciliation
//!
//! Chapters are keyed by url. A remote chapter absent locally is inserted as
//! unread; a chapter present on both sides only has its descriptive fields
//! refreshed. Read state, bookmarks and reading progress always come from the
//! local copy, and local-only chapters are never removed.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

use crate::models::{Chapter, RemoteChapter};

/// Outcome of reconciling one item
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterDiff {
    /// Chapters present remotely but not locally
    pub inserted: Vec<Chapter>,
    /// Local chapters whose descriptive fields changed
    pub updated: Vec<Chapter>,
    /// Count of matching chapters left as they were
    pub unchanged: usize,
    pub fetched_at: DateTime<Utc>,
}

impl ChapterDiff {
    pub fn empty(fetched_at: DateTime<Utc>) -> Self {
        Self {
            inserted: Vec::new(),
            updated: Vec::new(),
            unchanged: 0,
            fetched_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty()
    }
}

/// Reconcile a remote chapter list against the local chapter set
pub fn reconcile(local: &[Chapter], remote: &[RemoteChapter], fetched_at: DateTime<Utc>) -> ChapterDiff {
    let by_url: HashMap<&str, &Chapter> = local.iter().map(|c| (c.url.as_str(), c)).collect();

    let mut seen = HashSet::new();
    let remote: Vec<&RemoteChapter> = remote
        .iter()
        .filter(|chapter| seen.insert(chapter.url.as_str()))
        .collect();
    let total = remote.len();

    let mut diff = ChapterDiff::empty(fetched_at);
    for (order, chapter) in remote.into_iter().enumerate() {
        match by_url.get(chapter.url.as_str()) {
            Some(existing) => {
                let refreshed = refresh_descriptive(existing, chapter, order);
                if refreshed == **existing {
                    diff.unchanged += 1;
                } else {
                    diff.updated.push(refreshed);
                }
            }
            None => {
                // Newest chapters come first, so they get the latest fetch stamp.
                let stamp = fetched_at + Duration::milliseconds((total - order) as i64);
                diff.inserted.push(Chapter::from_remote(chapter, order, stamp));
            }
        }
    }

    diff
}

fn refresh_descriptive(local: &Chapter, remote: &RemoteChapter, order: usize) -> Chapter {
    Chapter {
        name: remote.name.clone(),
        chapter_number: remote.chapter_number,
        date_upload: remote.date_upload.or(local.date_upload),
        scanlator: remote.scanlator.clone(),
        source_order: order,
        ..local.clone()
    }
}
