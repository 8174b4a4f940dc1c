//! Library persistence contract
//!
//! This module provides the [`Repository`] trait the scheduler consumes, an
//! in-memory implementation and JSON snapshots for offline runs.

pub mod repository;
pub mod snapshot;

pub use repository::{MemoryRepository, Repository, StorageError};
pub use snapshot::{LibrarySnapshot, SnapshotItem, SnapshotSource};
