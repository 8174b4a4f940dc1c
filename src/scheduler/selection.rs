//! Candidate selection
//!
//! Selection is a pure function of the run configuration and the favorited
//! items: scope filter, dedupe by id, then the restriction predicates. Every
//! item that matches the scope ends up either selected or excluded with a
//! reason.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::error::{SchedulerError, SchedulerResult};
use crate::config::{CategoryFilter, RunConfiguration};
use crate::models::{Category, CategoryId, ItemId, ItemStatus, LibraryItem, SourceId, UpdateStrategy};

/// Named groups a run can target besides categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "group", content = "value", rename_all = "snake_case")]
pub enum LibraryGroup {
    /// Every item of one source
    Source(SourceId),
    /// Every item with one publication status
    Status(ItemStatus),
    /// Items without any user category
    Uncategorized,
}

/// What part of the library a run covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum UpdateScope {
    Library,
    Category(CategoryId),
    Group(LibraryGroup),
}

impl fmt::Display for UpdateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library => write!(f, "library"),
            Self::Category(id) => write!(f, "category:{id}"),
            Self::Group(LibraryGroup::Source(id)) => write!(f, "source:{id}"),
            Self::Group(LibraryGroup::Status(status)) => write!(f, "status:{status}"),
            Self::Group(LibraryGroup::Uncategorized) => write!(f, "uncategorized"),
        }
    }
}

/// What a run refreshes for each selected item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateTarget {
    /// Chapter lists, the regular library update
    #[default]
    Chapters,
    /// Title, cover and status only
    Covers,
    /// Tracker bindings
    Tracking,
}

impl fmt::Display for UpdateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chapters => "chapters",
            Self::Covers => "covers",
            Self::Tracking => "tracking",
        };
        write!(f, "{name}")
    }
}

/// Why an item matching the scope is left out of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    NotAlwaysUpdate,
    Completed,
    NoUnread,
    NotStarted,
    OutsideFetchWindow,
    NotTracked,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAlwaysUpdate => "update strategy is not 'always'",
            Self::Completed => "series is completed",
            Self::NoUnread => "no unread chapters",
            Self::NotStarted => "not started",
            Self::OutsideFetchWindow => "next update is outside the fetch window",
            Self::NotTracked => "no tracker bound",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An item left out of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedItem {
    pub item_id: ItemId,
    pub title: String,
    pub reason: ExclusionReason,
}

/// Result of candidate selection
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Items to update, sorted by title
    pub selected: Vec<LibraryItem>,
    /// Items matching the scope that were filtered out, sorted by title
    pub excluded: Vec<ExcludedItem>,
}

impl Selection {
    /// Number of distinct items that matched the scope
    pub fn matched(&self) -> usize {
        self.selected.len() + self.excluded.len()
    }
}

/// Fail when the scope names a category the library does not have
pub fn validate_scope(scope: &UpdateScope, categories: &[Category]) -> SchedulerResult<()> {
    if let UpdateScope::Category(id) = scope {
        if *id != CategoryId::DEFAULT && !categories.iter().any(|c| c.id == *id) {
            return Err(SchedulerError::unknown_category(*id));
        }
    }
    Ok(())
}

fn in_scope(item: &LibraryItem, scope: &UpdateScope, filter: &CategoryFilter) -> bool {
    match scope {
        UpdateScope::Library => {
            let categories = item.effective_categories();
            let included =
                filter.include.is_empty() || categories.iter().any(|c| filter.include.contains(c));
            let excluded = categories.iter().any(|c| filter.exclude.contains(c));
            included && !excluded
        }
        UpdateScope::Category(id) => item.effective_categories().contains(id),
        UpdateScope::Group(LibraryGroup::Source(source)) => item.source == *source,
        UpdateScope::Group(LibraryGroup::Status(status)) => item.status == *status,
        UpdateScope::Group(LibraryGroup::Uncategorized) => item.categories.is_empty(),
    }
}

/// First restriction an item hits, if any
fn exclusion(item: &LibraryItem, config: &RunConfiguration) -> Option<ExclusionReason> {
    match config.target {
        UpdateTarget::Covers => None,
        UpdateTarget::Tracking => (!item.tracked).then_some(ExclusionReason::NotTracked),
        UpdateTarget::Chapters => {
            let restrictions = &config.restrictions;
            if item.update_strategy != UpdateStrategy::Always {
                Some(ExclusionReason::NotAlwaysUpdate)
            } else if restrictions.skip_completed && item.status == ItemStatus::Completed {
                Some(ExclusionReason::Completed)
            } else if restrictions.skip_no_unread && item.unread_count == 0 {
                Some(ExclusionReason::NoUnread)
            } else if restrictions.skip_not_started && item.total_chapters > 0 && !item.has_started {
                Some(ExclusionReason::NotStarted)
            } else if restrictions.skip_outside_fetch_window
                && item.next_update.is_some_and(|next| config.window.is_beyond(next))
            {
                Some(ExclusionReason::OutsideFetchWindow)
            } else {
                None
            }
        }
    }
}

/// Compute the items eligible for a run
pub fn select(config: &RunConfiguration, all_items: &[LibraryItem]) -> Selection {
    let mut seen = HashSet::new();
    let mut selection = Selection::default();

    let candidates = all_items
        .iter()
        .filter(|item| item.favorite && in_scope(item, &config.scope, &config.categories))
        .filter(|item| seen.insert(item.id));

    for item in candidates {
        match exclusion(item, config) {
            Some(reason) => selection.excluded.push(ExcludedItem {
                item_id: item.id,
                title: item.title.clone(),
                reason,
            }),
            None => selection.selected.push(item.clone()),
        }
    }

    selection
        .selected
        .sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
    selection
        .excluded
        .sort_by(|a, b| a.title.cmp(&b.title).then(a.item_id.cmp(&b.item_id)));
    selection
}
