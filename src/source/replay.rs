//! Offline source replaying recorded responses
//!
//! Used by the CLI to run an update against a library snapshot without any
//! network access, and by tests as a deterministic source.

use async_trait::async_trait;
use std::collections::HashMap;

use super::{SourceClient, SourceError};
use crate::models::{ItemMetadata, LibraryItem, RemoteChapterList, SourceId};

/// Source answering from recorded chapter lists keyed by series url
#[derive(Debug, Clone)]
pub struct ReplaySource {
    id: SourceId,
    name: String,
    chapters: HashMap<String, RemoteChapterList>,
    details: HashMap<String, ItemMetadata>,
    failures: HashMap<String, SourceError>,
}

impl ReplaySource {
    pub fn new(id: SourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            chapters: HashMap::new(),
            details: HashMap::new(),
            failures: HashMap::new(),
        }
    }

    /// Record the chapter list served for a series url
    pub fn with_chapters(mut self, url: impl Into<String>, chapters: RemoteChapterList) -> Self {
        self.chapters.insert(url.into(), chapters);
        self
    }

    /// Record the metadata served for a series url
    pub fn with_details(mut self, url: impl Into<String>, details: ItemMetadata) -> Self {
        self.details.insert(url.into(), details);
        self
    }

    /// Make every request for a series url fail
    pub fn with_failure(mut self, url: impl Into<String>, error: SourceError) -> Self {
        self.failures.insert(url.into(), error);
        self
    }

    pub fn insert_chapters(&mut self, url: impl Into<String>, chapters: RemoteChapterList) {
        self.chapters.insert(url.into(), chapters);
    }

    pub fn insert_details(&mut self, url: impl Into<String>, details: ItemMetadata) {
        self.details.insert(url.into(), details);
    }

    fn check_failure(&self, url: &str) -> Result<(), SourceError> {
        match self.failures.get(url) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SourceClient for ReplaySource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get_details(&self, item: &LibraryItem) -> Result<ItemMetadata, SourceError> {
        self.check_failure(&item.url)?;
        Ok(self.details.get(&item.url).cloned().unwrap_or_default())
    }

    async fn get_chapters(&self, item: &LibraryItem) -> Result<RemoteChapterList, SourceError> {
        self.check_failure(&item.url)?;
        self.chapters
            .get(&item.url)
            .cloned()
            .ok_or(SourceError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RemoteChapter;

    #[tokio::test]
    async fn test_replay_serves_recorded_chapters() {
        let item = LibraryItem::new(1, 1, "One");
        let source = ReplaySource::new(SourceId(1), "Replay")
            .with_chapters(item.url.clone(), vec![RemoteChapter::new("/c/1", "Ch. 1", 1.0)]);

        let chapters = source.get_chapters(&item).await.unwrap();
        assert_eq!(chapters.len(), 1);

        let unknown = LibraryItem::new(2, 1, "Two");
        assert_eq!(
            source.get_chapters(&unknown).await,
            Err(SourceError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_replay_failure() {
        let item = LibraryItem::new(1, 1, "One");
        let source = ReplaySource::new(SourceId(1), "Replay")
            .with_failure(item.url.clone(), SourceError::Http { status: 503 });

        assert!(source.get_details(&item).await.is_err());
        assert!(source.get_chapters(&item).await.is_err());
    }
}
