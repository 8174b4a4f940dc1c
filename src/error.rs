//! Unified error handling for the shelf-updater crate
//!
//! This module provides a unified error type that consolidates all domain-specific
//! errors into a single `Error` enum, while maintaining the ability to use
//! domain-specific errors when needed.
//!
//! # Architecture
//!
//! - [`UpdaterErrorTrait`] - Common interface implemented by the unified error
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! Item-level failures ([`ItemError`]) normally stay inside a run report. They
//! only become an [`Error`] when a caller processes a single item directly.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shelf_updater::error::{Error, ErrorCategory, UpdaterErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         println!("Retry later: {}", err);
//!     } else {
//!         eprintln!("Fatal error ({}): {}", err.category(), err);
//!     }
//! }
//! ```

use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

// Re-export domain-specific errors for convenience
pub use crate::notifications::NotificationError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::scheduler::updater::ItemError;
pub use crate::source::SourceError;
pub use crate::storage::StorageError;

/// Common trait for shelf-updater error types
pub trait UpdaterErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source client errors (transport, HTTP, parse)
    Network,
    /// Repository and I/O errors
    Storage,
    /// Run selection and lifecycle errors
    Scheduler,
    /// Notification and error log delivery
    Notification,
    /// Configuration and validation errors
    Config,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Scheduler => "scheduler",
            Self::Notification => "notification",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the shelf-updater crate
#[derive(Error, Debug)]
pub enum Error {
    /// Source client errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Repository errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Run selection and lifecycle errors
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Failure of a single item update
    #[error("Item error: {0}")]
    Item(#[from] ItemError),

    /// Event or error log delivery errors
    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl UpdaterErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Source(e) => e.is_recoverable(),
            Self::Storage(StorageError::Backend(_)) => true,
            Self::Storage(StorageError::ItemNotFound(_)) => false,
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Item(e) => match e {
                ItemError::Fetch { source, .. } => source.is_recoverable(),
                ItemError::PoolExhausted { .. } | ItemError::Storage { .. } => true,
                ItemError::NoNewData | ItemError::SourceUnavailable(_) | ItemError::Panicked(_) => {
                    false
                }
            },
            Self::Notification(NotificationError::Unavailable(_)) => true,
            Self::Notification(_) => false,
            Self::Io(_) => true, // I/O errors are often transient
            Self::Json(_) => false,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Source(_) => ErrorCategory::Network,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Item(e) => match e {
                ItemError::Storage { .. } => ErrorCategory::Storage,
                ItemError::PoolExhausted { .. } | ItemError::Panicked(_) => ErrorCategory::Scheduler,
                _ => ErrorCategory::Network,
            },
            Self::Notification(_) | Self::Json(_) => ErrorCategory::Notification,
            Self::Config(_) => ErrorCategory::Config,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CategoryId, ItemId};

    #[test]
    fn test_error_category() {
        let source_err = Error::Source(SourceError::Transport("reset".into()));
        assert_eq!(source_err.category(), ErrorCategory::Network);

        let storage_err = Error::Storage(StorageError::ItemNotFound(ItemId(1)));
        assert_eq!(storage_err.category(), ErrorCategory::Storage);

        let scheduler_err: Error = SchedulerError::unknown_category(CategoryId(3)).into();
        assert_eq!(scheduler_err.category(), ErrorCategory::Scheduler);
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::Source(SourceError::Http { status: 503 }).is_recoverable());
        assert!(!Error::Source(SourceError::NotFound).is_recoverable());
        assert!(!Error::Item(ItemError::NoNewData).is_recoverable());
        assert!(Error::Item(ItemError::PoolExhausted { waited_secs: 30 }).is_recoverable());
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("global_concurrency must be at least 1");
        assert_eq!(err.category(), ErrorCategory::Config);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_other_error() {
        let err = Error::other("Something went wrong");
        assert_eq!(err.category(), ErrorCategory::Other);
        assert_eq!(err.to_string(), "Something went wrong");
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: Error = anyhow::anyhow!("snapshot missing").into();
        assert!(matches!(err, Error::Other { .. }));
    }
}
