//! Detailed failure log written after a run with failures
//!
//! Failures are grouped by error message, then by source name, so a single
//! broken source shows up as one block instead of hundreds of lines.
//!
//! ```text
//! Errors during library update 5f0c...
//!
//! ! Transport error: connection reset
//!   # MangaSite
//!     - Series A
//!     - Series B
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use super::NotificationResult;
use crate::scheduler::aggregator::ItemFailure;

/// Produces the detailed failure artifact referenced by the error event
#[async_trait]
pub trait ErrorLogWriter: Send + Sync {
    /// Write the log and return its location
    async fn write(&self, run_id: Uuid, failures: &[ItemFailure]) -> NotificationResult<PathBuf>;
}

/// Writes one text file per run into a directory
#[derive(Debug, Clone)]
pub struct FileErrorLog {
    dir: PathBuf,
}

impl FileErrorLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Render the grouped failure listing
    pub fn render(run_id: Uuid, failures: &[ItemFailure]) -> String {
        let mut grouped: BTreeMap<&str, BTreeMap<&str, Vec<&str>>> = BTreeMap::new();
        for failure in failures {
            grouped
                .entry(failure.message.as_str())
                .or_default()
                .entry(failure.item.source_name.as_str())
                .or_default()
                .push(failure.item.title.as_str());
        }

        let mut out = format!("Errors during library update {run_id}\n");
        for (message, sources) in grouped {
            out.push_str(&format!("\n! {message}\n"));
            for (source, mut titles) in sources {
                titles.sort_unstable();
                out.push_str(&format!("  # {source}\n"));
                for title in titles {
                    out.push_str(&format!("    - {title}\n"));
                }
            }
        }
        out
    }
}

#[async_trait]
impl ErrorLogWriter for FileErrorLog {
    async fn write(&self, run_id: Uuid, failures: &[ItemFailure]) -> NotificationResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let name = format!(
            "shelf_update_errors_{}_{}.txt",
            Utc::now().format("%Y%m%d_%H%M%S"),
            run_id.simple()
        );
        let path = self.dir.join(name);
        tokio::fs::write(&path, Self::render(run_id, failures)).await?;

        debug!(path = %path.display(), failures = failures.len(), "Error log written");
        Ok(path)
    }
}
