//! Error types for the scheduler module
//!
//! These are run-level errors. Per-item failures never abort a run and are
//! modelled separately by [`ItemError`](super::updater::ItemError).

use std::fmt;

use crate::models::CategoryId;
use crate::storage::StorageError;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// The scope names a category the library does not have
    UnknownCategory { id: CategoryId },

    /// The favorited items or categories could not be loaded
    LibraryUnavailable { reason: String },

    /// A tracking run was requested without a tracker
    TrackerUnavailable,

    /// Another run covers an overlapping scope
    AlreadyRunning { scope: String },

    /// The run task ended abnormally
    RunFailed { reason: String },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCategory { id } => {
                write!(f, "Unknown category '{}'", id)
            }
            Self::LibraryUnavailable { reason } => {
                write!(f, "Failed to load library: {}", reason)
            }
            Self::TrackerUnavailable => {
                write!(f, "No tracker configured for a tracking update")
            }
            Self::AlreadyRunning { scope } => {
                write!(f, "An update covering '{}' is already running", scope)
            }
            Self::RunFailed { reason } => {
                write!(f, "Update run failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StorageError> for SchedulerError {
    fn from(err: StorageError) -> Self {
        Self::LibraryUnavailable {
            reason: err.to_string(),
        }
    }
}

impl SchedulerError {
    /// Create an unknown category error
    pub fn unknown_category(id: CategoryId) -> Self {
        Self::UnknownCategory { id }
    }

    /// Create an already running error
    pub fn already_running(scope: impl fmt::Display) -> Self {
        Self::AlreadyRunning {
            scope: scope.to_string(),
        }
    }

    /// Create a run failure error
    pub fn run_failed(reason: impl Into<String>) -> Self {
        Self::RunFailed {
            reason: reason.into(),
        }
    }

    /// Errors raised while selecting candidates abort the run
    pub fn is_selection_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownCategory { .. } | Self::LibraryUnavailable { .. } | Self::TrackerUnavailable
        )
    }

    /// Check if retrying later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LibraryUnavailable { .. } | Self::AlreadyRunning { .. } | Self::RunFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_category_error() {
        let err = SchedulerError::unknown_category(CategoryId(7));
        assert!(err.to_string().contains('7'));
        assert!(err.is_selection_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_storage_error_converts() {
        let err: SchedulerError = StorageError::Backend("locked".into()).into();
        assert!(err.to_string().contains("locked"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_already_running() {
        let err = SchedulerError::already_running("library");
        assert!(err.to_string().contains("library"));
        assert!(!err.is_selection_error());
    }
}
