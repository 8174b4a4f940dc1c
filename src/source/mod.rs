//! Remote source contract and source resolution
//!
//! The scheduler never talks to a concrete network client. It consumes
//! sources through [`SourceClient`] and resolves every source id once per run
//! into one of a closed set of variants:
//!
//! - **Plain** - a well-behaved source, requests are never paced
//! - **Throttled** - a source with a [`ThrottlePolicy`] that the
//!   [`SourceThrottle`](crate::scheduler::SourceThrottle) enforces
//! - **Composite** - a virtual source whose items merge several constituent
//!   series hosted on other sources
//!
//! # Example
//!
//! ```rust,ignore
//! use shelf_updater::source::SourceCatalog;
//!
//! let mut catalog = SourceCatalog::new();
//! catalog.register(Arc::new(my_client));
//! catalog.register_throttled(Arc::new(strict_client), ThrottlePolicy::adaptive_default());
//! catalog.register_composite(SourceId(6969), "Merged");
//!
//! let resolved = catalog.resolve(SourceId(1)).expect("installed");
//! ```

pub mod replay;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{ItemMetadata, LibraryItem, RemoteChapterList, SourceId};
use crate::scheduler::throttle::ThrottlePolicy;

pub use replay::ReplaySource;

/// Errors surfaced by a source client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// Connection, DNS or timeout failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("HTTP error {status}")]
    Http { status: u16 },

    /// Response could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// The series no longer exists on the source
    #[error("Series not found on source")]
    NotFound,

    /// Anything else the client reports
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Check if the error is likely transient
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Parse(_) | Self::NotFound | Self::Other(_) => false,
        }
    }
}

/// Contract every remote source client fulfils
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Source identifier
    fn id(&self) -> SourceId;

    /// Human readable source name
    fn name(&self) -> &str;

    /// Fetch descriptive metadata for an item
    async fn get_details(&self, item: &LibraryItem) -> Result<ItemMetadata, SourceError>;

    /// Fetch the item's chapter list in source order
    async fn get_chapters(&self, item: &LibraryItem) -> Result<RemoteChapterList, SourceError>;
}

/// External tracker synchronisation (e.g. reading-progress services)
#[async_trait]
pub trait TrackerSync: Send + Sync {
    /// Refresh the tracker bindings of one item
    async fn refresh(&self, item: &LibraryItem) -> Result<(), SourceError>;
}

/// Virtual source merging several constituent series into one item
#[derive(Debug, Clone)]
pub struct CompositeSource {
    pub id: SourceId,
    pub name: String,
}

/// Variant a source id resolves to
#[derive(Clone)]
pub enum SourceKind {
    Plain(Arc<dyn SourceClient>),
    Throttled {
        client: Arc<dyn SourceClient>,
        policy: ThrottlePolicy,
    },
    Composite(CompositeSource),
}

impl std::fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(client) => write!(f, "Plain({})", client.id()),
            Self::Throttled { client, policy } => {
                write!(f, "Throttled({}, {:?})", client.id(), policy)
            }
            Self::Composite(composite) => write!(f, "Composite({})", composite.id),
        }
    }
}

/// A source id resolved once for a run
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub id: SourceId,
    pub name: String,
    pub kind: SourceKind,
}

impl ResolvedSource {
    /// Client backing a non-composite source
    pub fn client(&self) -> Option<&Arc<dyn SourceClient>> {
        match &self.kind {
            SourceKind::Plain(client) | SourceKind::Throttled { client, .. } => Some(client),
            SourceKind::Composite(_) => None,
        }
    }

    /// Pacing policy of the source
    pub fn throttle_policy(&self) -> ThrottlePolicy {
        match &self.kind {
            SourceKind::Throttled { policy, .. } => policy.clone(),
            SourceKind::Plain(_) | SourceKind::Composite(_) => ThrottlePolicy::Unlimited,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, SourceKind::Composite(_))
    }
}

/// Registry of installed sources
#[derive(Default, Clone)]
pub struct SourceCatalog {
    sources: HashMap<SourceId, ResolvedSource>,
}

impl SourceCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source that needs no pacing
    pub fn register(&mut self, client: Arc<dyn SourceClient>) {
        let id = client.id();
        let name = client.name().to_string();
        self.sources.insert(
            id,
            ResolvedSource {
                id,
                name,
                kind: SourceKind::Plain(client),
            },
        );
    }

    /// Register a source whose requests must be paced
    pub fn register_throttled(&mut self, client: Arc<dyn SourceClient>, policy: ThrottlePolicy) {
        let id = client.id();
        let name = client.name().to_string();
        let kind = match policy {
            ThrottlePolicy::Unlimited => SourceKind::Plain(client),
            policy => SourceKind::Throttled { client, policy },
        };
        self.sources.insert(id, ResolvedSource { id, name, kind });
    }

    /// Register a merged source
    pub fn register_composite(&mut self, id: SourceId, name: impl Into<String>) {
        let name = name.into();
        self.sources.insert(
            id,
            ResolvedSource {
                id,
                name: name.clone(),
                kind: SourceKind::Composite(CompositeSource { id, name }),
            },
        );
    }

    /// Resolve a source id, `None` when the source is not installed
    pub fn resolve(&self, id: SourceId) -> Option<ResolvedSource> {
        self.sources.get(&id).cloned()
    }

    /// Display name of a source, falling back to its id
    pub fn name_of(&self, id: SourceId) -> String {
        self.sources
            .get(&id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Throttle policies of every throttled source
    pub fn throttle_policies(&self) -> Vec<(SourceId, ThrottlePolicy)> {
        self.sources
            .values()
            .filter_map(|s| match &s.kind {
                SourceKind::Throttled { policy, .. } => Some((s.id, policy.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
