//! Concurrency coordination
//!
//! Selected items are partitioned by source and each source gets one lane
//! task. All lanes share a single global pool of worker slots, and within a
//! lane at most `per_source_concurrency` items are in flight. Per item:
//!
//! ```text
//! wait for slot ─► cancelled? ─► throttle ─► work ─► record ─► release slot
//! ```
//!
//! Cancellation is cooperative. It is checked before an item takes a slot
//! and again right after; items already past that point run to completion.
//! A panicking work unit is recorded as a failure of that item only.

use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::OutcomeAggregator;
use super::progress::ProgressTracker;
use super::throttle::SourceThrottle;
use super::updater::{ItemError, ItemWork, UpdateOutcome};
use crate::metrics;
use crate::models::{LibraryItem, SourceId};
use crate::source::{ResolvedSource, SourceCatalog};

enum Slot {
    Acquired(OwnedSemaphorePermit),
    Cancelled,
    TimedOut(Duration),
}

/// State shared by every lane of one run
struct Lanes {
    throttle: Arc<SourceThrottle>,
    pool: Arc<Semaphore>,
    slot_timeout: Option<Duration>,
    work: Arc<dyn ItemWork>,
    aggregator: Arc<OutcomeAggregator>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl Lanes {
    async fn acquire_slot(&self) -> Slot {
        let acquire = async {
            let permit = self.pool.clone().acquire_owned();
            match self.slot_timeout {
                Some(limit) => tokio::time::timeout(limit, permit).await.map_err(|_| limit),
                None => Ok(permit.await),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Slot::Cancelled,
            result = acquire => match result {
                Ok(Ok(permit)) => Slot::Acquired(permit),
                Ok(Err(_closed)) => Slot::Cancelled,
                Err(limit) => Slot::TimedOut(limit),
            },
        }
    }

    async fn process(&self, item: LibraryItem, source: &ResolvedSource) {
        if self.cancel.is_cancelled() {
            return;
        }

        let permit = match self.acquire_slot().await {
            Slot::Acquired(permit) => permit,
            Slot::Cancelled => return,
            Slot::TimedOut(limit) => {
                let outcome = UpdateOutcome::Failure(ItemError::PoolExhausted {
                    waited_secs: limit.as_secs(),
                });
                self.aggregator.record(&item, &source.name, outcome);
                return;
            }
        };

        if self.cancel.is_cancelled() {
            return;
        }

        self.progress.start(item.id, &item.title);
        metrics::item_started();

        let attempt = async {
            self.throttle.acquire(source.id).await;
            self.work.process(&item, source).await
        };
        let outcome = match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(result) => UpdateOutcome::from(result),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(item_id = %item.id, title = %item.title, panic = %message, "Item update panicked");
                UpdateOutcome::Failure(ItemError::Panicked(message))
            }
        };
        self.aggregator.record(&item, &source.name, outcome);

        metrics::item_finished();
        self.progress.finish(item.id);
        drop(permit);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives the work units of a run over a bounded worker pool
pub struct ConcurrencyCoordinator {
    catalog: Arc<SourceCatalog>,
    throttle: Arc<SourceThrottle>,
    global_concurrency: usize,
    per_source_concurrency: usize,
    slot_timeout: Option<Duration>,
}

impl ConcurrencyCoordinator {
    pub fn new(catalog: Arc<SourceCatalog>, throttle: Arc<SourceThrottle>) -> Self {
        Self {
            catalog,
            throttle,
            global_concurrency: 5,
            per_source_concurrency: 1,
            slot_timeout: None,
        }
    }

    /// Set the global and per-source bounds, both at least one
    pub fn with_limits(mut self, global: usize, per_source: usize) -> Self {
        self.global_concurrency = global.max(1);
        self.per_source_concurrency = per_source.max(1);
        self
    }

    /// Fail items that wait longer than `timeout` for a slot
    pub fn with_slot_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.slot_timeout = timeout;
        self
    }

    /// Group items by source, dropping duplicate ids
    fn partition(items: Vec<LibraryItem>) -> BTreeMap<SourceId, Vec<LibraryItem>> {
        let mut seen = HashSet::new();
        let mut groups: BTreeMap<SourceId, Vec<LibraryItem>> = BTreeMap::new();
        for item in items {
            if seen.insert(item.id) {
                groups.entry(item.source).or_default().push(item);
            }
        }
        groups
    }

    /// Process every item, recording outcomes into the aggregator
    pub async fn run(
        &self,
        items: Vec<LibraryItem>,
        work: Arc<dyn ItemWork>,
        aggregator: Arc<OutcomeAggregator>,
        progress: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) {
        let groups = Self::partition(items);
        info!(
            sources = groups.len(),
            global = self.global_concurrency,
            per_source = self.per_source_concurrency,
            "Dispatching item updates"
        );

        let lanes = Arc::new(Lanes {
            throttle: self.throttle.clone(),
            pool: Arc::new(Semaphore::new(self.global_concurrency)),
            slot_timeout: self.slot_timeout,
            work,
            aggregator,
            progress,
            cancel,
        });

        let mut tasks = JoinSet::new();
        for (source_id, items) in groups {
            let Some(source) = self.catalog.resolve(source_id) else {
                if lanes.cancel.is_cancelled() {
                    continue;
                }
                let name = self.catalog.name_of(source_id);
                for item in &items {
                    let outcome = UpdateOutcome::Failure(ItemError::SourceUnavailable(source_id));
                    lanes.aggregator.record(item, &name, outcome);
                }
                continue;
            };

            let lanes = lanes.clone();
            let per_source = self.per_source_concurrency;
            tasks.spawn(async move {
                debug!(source = %source.id, name = %source.name, items = items.len(), "Lane started");
                futures::stream::iter(items)
                    .for_each_concurrent(per_source, |item| {
                        let lanes = lanes.clone();
                        let source = source.clone();
                        async move { lanes.process(item, &source).await }
                    })
                    .await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Source lane terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoDownloadPolicy;
    use crate::models::Chapter;
    use crate::notifications::NoopDownloads;
    use crate::scheduler::progress::NoopReporter;
    use crate::source::ReplaySource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ItemWork for Counting {
        async fn process(
            &self,
            _item: &LibraryItem,
            _source: &ResolvedSource,
        ) -> Result<Vec<Chapter>, ItemError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    /// Panics on the item with the given id
    struct PanicsOn(crate::models::ItemId, Counting);

    #[async_trait]
    impl ItemWork for PanicsOn {
        async fn process(
            &self,
            item: &LibraryItem,
            source: &ResolvedSource,
        ) -> Result<Vec<Chapter>, ItemError> {
            if item.id == self.0 {
                panic!("parser blew up on {}", item.title);
            }
            self.1.process(item, source).await
        }
    }

    fn catalog(sources: u64) -> Arc<SourceCatalog> {
        let mut catalog = SourceCatalog::new();
        for id in 0..sources {
            catalog.register(Arc::new(ReplaySource::new(SourceId(id), format!("S{id}"))));
        }
        Arc::new(catalog)
    }

    fn aggregator() -> Arc<OutcomeAggregator> {
        Arc::new(OutcomeAggregator::new(
            Uuid::new_v4(),
            AutoDownloadPolicy::default(),
            Arc::new(NoopDownloads),
        ))
    }

    fn items(n: i64, sources: u64) -> Vec<LibraryItem> {
        (0..n)
            .map(|i| LibraryItem::new(i, i as u64 % sources, format!("Item {i}")))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_bound_respected() {
        let work = Arc::new(Counting::default());
        let aggregator = aggregator();
        let coordinator =
            ConcurrencyCoordinator::new(catalog(8), Arc::new(SourceThrottle::new())).with_limits(3, 4);

        coordinator
            .run(
                items(40, 8),
                work.clone(),
                aggregator.clone(),
                Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 40)),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(work.calls.load(Ordering::SeqCst), 40);
        assert!(work.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(aggregator.recorded(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_source_lane_is_sequential() {
        let work = Arc::new(Counting::default());
        let coordinator =
            ConcurrencyCoordinator::new(catalog(1), Arc::new(SourceThrottle::new())).with_limits(5, 1);

        coordinator
            .run(
                items(6, 1),
                work.clone(),
                aggregator(),
                Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 6)),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(work.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicates_processed_once() {
        let work = Arc::new(Counting::default());
        let mut list = items(3, 1);
        list.push(list[0].clone());

        ConcurrencyCoordinator::new(catalog(1), Arc::new(SourceThrottle::new()))
            .run(
                list,
                work.clone(),
                aggregator(),
                Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 3)),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(work.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_source_recorded_as_failure() {
        let work = Arc::new(Counting::default());
        let aggregator = aggregator();

        ConcurrencyCoordinator::new(catalog(1), Arc::new(SourceThrottle::new()))
            .run(
                vec![LibraryItem::new(1, 42, "Orphan")],
                work.clone(),
                aggregator.clone(),
                Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 1)),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(work.calls.load(Ordering::SeqCst), 0);
        assert_eq!(aggregator.recorded(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let work = Arc::new(Counting::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        ConcurrencyCoordinator::new(catalog(2), Arc::new(SourceThrottle::new()))
            .run(
                items(10, 2),
                work.clone(),
                aggregator(),
                Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 10)),
                cancel,
            )
            .await;

        assert_eq!(work.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_timeout_records_pool_exhausted() {
        let work = Arc::new(Counting::default());
        let aggregator = aggregator();

        ConcurrencyCoordinator::new(catalog(2), Arc::new(SourceThrottle::new()))
            .with_limits(1, 1)
            .with_slot_timeout(Some(Duration::from_millis(5)))
            .run(
                items(2, 2),
                work.clone(),
                aggregator.clone(),
                Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 2)),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(work.calls.load(Ordering::SeqCst), 1);
        assert_eq!(aggregator.recorded(), 2);
    }

    #[tokio::test]
    async fn test_panicking_item_does_not_stop_its_lane() {
        let work = Arc::new(PanicsOn(crate::models::ItemId(0), Counting::default()));
        let aggregator = aggregator();
        let progress = Arc::new(ProgressTracker::new(Arc::new(NoopReporter), 3));

        ConcurrencyCoordinator::new(catalog(1), Arc::new(SourceThrottle::new()))
            .run(
                items(3, 1),
                work.clone(),
                aggregator.clone(),
                progress.clone(),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(work.1.calls.load(Ordering::SeqCst), 2);
        assert_eq!(aggregator.recorded(), 3);
        assert_eq!(progress.in_flight(), 0);
    }
}
