//! Registry of active runs
//!
//! Registration is an atomic check-and-insert: a run whose scope overlaps an
//! active run is rejected, never queued. The returned [`RunGuard`] removes
//! the entry when dropped, so every exit path of a run releases its scope.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::selection::{UpdateScope, UpdateTarget};

/// An active run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRun {
    pub run_id: Uuid,
    pub scope: UpdateScope,
    pub target: UpdateTarget,
    pub started_at: DateTime<Utc>,
}

/// Whether two scopes may touch the same item
///
/// An item has exactly one source and one status but may sit in several
/// categories, so only two distinct source groups or two distinct status
/// groups are known to be disjoint.
pub fn scopes_overlap(a: &UpdateScope, b: &UpdateScope) -> bool {
    match (a, b) {
        (UpdateScope::Library, _) | (_, UpdateScope::Library) => true,
        (UpdateScope::Group(x), UpdateScope::Group(y)) => {
            use super::selection::LibraryGroup::*;
            match (x, y) {
                (Source(s), Source(t)) => s == t,
                (Status(s), Status(t)) => s == t,
                _ => true,
            }
        }
        _ => true,
    }
}

/// Tracks which scopes are being updated
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashMap<Uuid, ActiveRun>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run unless an overlapping run is active
    pub fn try_register(&self, run: ActiveRun) -> Result<RunGuard, ActiveRun> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = active
            .values()
            .find(|existing| scopes_overlap(&existing.scope, &run.scope))
        {
            return Err(existing.clone());
        }

        let run_id = run.run_id;
        active.insert(run_id, run);
        Ok(RunGuard {
            registry: self.clone(),
            run_id,
        })
    }

    /// Whether any active run overlaps `scope`
    pub fn is_running(&self, scope: &UpdateScope) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|run| scopes_overlap(&run.scope, scope))
    }

    /// Snapshot of active runs
    pub fn active(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<_> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.started_at);
        runs
    }

    fn release(&self, run_id: &Uuid) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
    }
}

/// Keeps a run registered until dropped
#[derive(Debug)]
pub struct RunGuard {
    registry: RunRegistry,
    run_id: Uuid,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release(&self.run_id);
    }
}
