//! Multi-projection materialization with a safe/unsafe split.
//!
//! Events older than the safe window are folded once into a durable *safe*
//! state; newer (unsafe) events are re-read on every refresh and folded on top
//! of a copy of it, because a concurrent writer may still commit an event that
//! sorts before them. Only the safe state is ever snapshotted.
//!
//! ```text
//!   read_by_group(after = safe cursor)
//!        │
//!        ├── id <= threshold ──► fold into safe state (durable)
//!        │
//!        └── id >  threshold ──► unsafe tail (re-read next time)
//!
//!   view = safe state + unsafe tail
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use foldwise_core::{Clock, EventId, SortableUniqueId};
use foldwise_events::{
    EventEnvelope, MultiProjectionState, MultiProjector, ProjectionError, QueryContext,
};

use crate::blob_store::{BlobKey, BlobStore};
use crate::config::{EngineConfig, FoldFailurePolicy};
use crate::event_store::{EventStore, EventStoreError};
use crate::snapshot::{SnapshotEnvelope, SnapshotStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionRefreshError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("projection '{projector}' refresh timed out after {after:?}")]
    TimedOut {
        projector: &'static str,
        after: Duration,
    },

    #[error("projection worker '{0}' is no longer running")]
    WorkerGone(&'static str),
}

/// The event a refresh stopped at under [`FoldFailurePolicy::Halt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldFailure {
    pub event_id: EventId,
    pub sortable_unique_id: SortableUniqueId,
    pub event_type: String,
    pub error: ProjectionError,
}

impl FoldFailure {
    fn new(envelope: &EventEnvelope, error: ProjectionError) -> Self {
        Self {
            event_id: envelope.id(),
            sortable_unique_id: envelope.sortable_unique_id().clone(),
            event_type: envelope.event_type().to_string(),
            error,
        }
    }
}

/// A materialized projection as served to queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionView<P> {
    projector: &'static str,
    state: MultiProjectionState<P>,
    safe_version: u64,
    safe_sortable_unique_id: Option<SortableUniqueId>,
    warnings: Vec<String>,
    fold_failure: Option<FoldFailure>,
}

impl<P> ProjectionView<P> {
    /// Safe state plus the unsafe tail.
    pub fn state(&self) -> &MultiProjectionState<P> {
        &self.state
    }

    pub fn safe_version(&self) -> u64 {
        self.safe_version
    }

    pub fn unsafe_version(&self) -> u64 {
        self.state.version() - self.safe_version
    }

    pub fn safe_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.safe_sortable_unique_id.as_ref()
    }

    pub fn last_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.state.last_sortable_unique_id()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn fold_failure(&self) -> Option<&FoldFailure> {
        self.fold_failure.as_ref()
    }

    /// Whether the view has folded everything up to and including `id`.
    pub fn covers(&self, id: &SortableUniqueId) -> bool {
        self.last_sortable_unique_id().is_some_and(|last| last >= id)
    }

    /// A copy of this view carrying one more warning.
    pub(crate) fn degraded(&self, warning: String) -> Self
    where
        P: Clone,
    {
        let mut view = self.clone();
        view.warnings.push(warning);
        view
    }

    pub fn context(&self) -> QueryContext {
        QueryContext {
            projector: self.projector,
            safe_version: self.safe_version,
            unsafe_version: self.unsafe_version(),
            safe_sortable_unique_id: self.safe_sortable_unique_id.clone(),
            last_sortable_unique_id: self.last_sortable_unique_id().cloned(),
        }
    }
}

/// The last snapshot this engine wrote or restored from.
struct Persisted {
    safe_id: Option<SortableUniqueId>,
    safe_version: u64,
    blob_key: Option<BlobKey>,
    at: Instant,
}

#[derive(Default)]
struct Scan {
    read: usize,
    unsafe_events: Vec<EventEnvelope>,
    warnings: Vec<String>,
    failure: Option<FoldFailure>,
}

/// Owns one projector's safe state, its latest view and its snapshot cursor.
///
/// Not shared: a projection worker drives it from a single task.
pub struct MultiProjectionEngine<M: MultiProjector> {
    store: Arc<dyn EventStore>,
    blobs: Arc<dyn BlobStore>,
    snapshots: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    safe: Option<MultiProjectionState<M::Payload>>,
    view: Option<Arc<ProjectionView<M::Payload>>>,
    poison: BTreeSet<SortableUniqueId>,
    persisted: Persisted,
    dirty: bool,
    refreshed_at: Option<Instant>,
}

impl<M: MultiProjector> MultiProjectionEngine<M> {
    pub fn new(
        store: Arc<dyn EventStore>,
        blobs: Arc<dyn BlobStore>,
        snapshots: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            snapshots,
            clock,
            config,
            safe: None,
            view: None,
            poison: BTreeSet::new(),
            persisted: Persisted {
                safe_id: None,
                safe_version: 0,
                blob_key: None,
                at: Instant::now(),
            },
            dirty: true,
            refreshed_at: None,
        }
    }

    pub fn view(&self) -> Option<&Arc<ProjectionView<M::Payload>>> {
        self.view.as_ref()
    }

    /// Ids skipped under [`FoldFailurePolicy::SkipPoison`] that the last
    /// snapshot has not yet moved past.
    pub fn poisoned(&self) -> &BTreeSet<SortableUniqueId> {
        &self.poison
    }

    /// An update notice arrived; the next read refreshes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Drop the cached state. The next refresh restores from the snapshot
    /// store, or replays from the start.
    pub fn invalidate(&mut self) {
        self.safe = None;
        self.view = None;
        self.dirty = true;
    }

    pub fn needs_refresh(&self, wait_for: Option<&SortableUniqueId>) -> bool {
        let Some(view) = &self.view else {
            return true;
        };
        self.dirty
            || self
                .refreshed_at
                .is_none_or(|at| at.elapsed() >= self.config.cache_ttl())
            || wait_for.is_some_and(|id| !view.covers(id))
    }

    /// Catch up with the store and publish a new view.
    ///
    /// A projector failure does not fail the refresh: the view carries the
    /// failure and a warning. Store errors do.
    pub async fn refresh(&mut self) -> Result<Arc<ProjectionView<M::Payload>>, ProjectionRefreshError> {
        let threshold =
            SortableUniqueId::safe_window_threshold(self.clock.now(), self.config.safe_window());

        let mut safe = match self.safe.take() {
            Some(safe) => safe,
            None => self.restore().await,
        };
        let safe_before = safe.version();

        let scan = self.scan(&mut safe, &threshold).await;
        let mut scan = match scan {
            Ok(scan) => scan,
            Err(err) => {
                self.safe = Some(safe);
                return Err(err);
            }
        };

        if let (0, Some(view)) = (scan.read, &self.view) {
            let view = Arc::clone(view);
            self.persist(&safe).await;
            self.safe = Some(safe);
            self.dirty = false;
            self.refreshed_at = Some(Instant::now());
            return Ok(view);
        }

        let mut state = safe.clone();
        if scan.failure.is_none() {
            for envelope in &scan.unsafe_events {
                if let Err(failure) = self.fold(&mut state, envelope, &mut scan.warnings) {
                    scan.failure = Some(failure);
                    break;
                }
            }
        }
        if let Some(failure) = &scan.failure {
            scan.warnings.push(format!(
                "projection '{}' stopped at event {} ({}): {}",
                M::NAME,
                failure.sortable_unique_id,
                failure.event_type,
                failure.error
            ));
        }

        let view = Arc::new(ProjectionView {
            projector: M::NAME,
            safe_version: safe.version(),
            safe_sortable_unique_id: safe.last_sortable_unique_id().cloned(),
            state,
            warnings: scan.warnings,
            fold_failure: scan.failure,
        });
        debug!(
            projector = M::NAME,
            safe_folded = safe.version() - safe_before,
            safe_version = view.safe_version(),
            unsafe_version = view.unsafe_version(),
            "projection refreshed"
        );

        self.persist(&safe).await;
        self.safe = Some(safe);
        self.view = Some(Arc::clone(&view));
        self.dirty = false;
        self.refreshed_at = Some(Instant::now());
        Ok(view)
    }

    async fn scan(
        &mut self,
        safe: &mut MultiProjectionState<M::Payload>,
        threshold: &SortableUniqueId,
    ) -> Result<Scan, ProjectionRefreshError> {
        let store = Arc::clone(&self.store);
        let mut events = store.read_by_group(M::selector(), safe.last_sortable_unique_id().cloned());
        let mut scan = Scan::default();

        while let Some(envelope) = events.next().await {
            let envelope = envelope?;
            scan.read += 1;
            if envelope.sortable_unique_id() > threshold {
                scan.unsafe_events.push(envelope);
                continue;
            }
            if let Err(failure) = self.fold(safe, &envelope, &mut scan.warnings) {
                scan.failure = Some(failure);
                break;
            }
        }
        Ok(scan)
    }

    /// Fold one event, applying the configured failure policy.
    fn fold(
        &mut self,
        state: &mut MultiProjectionState<M::Payload>,
        envelope: &EventEnvelope,
        warnings: &mut Vec<String>,
    ) -> Result<(), FoldFailure> {
        let id = envelope.sortable_unique_id();
        if self.poison.contains(id) {
            return state
                .skip(envelope)
                .map_err(|e| FoldFailure::new(envelope, e));
        }

        let error = match state.apply::<M>(envelope) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match self.config.fold_failure_policy {
            FoldFailurePolicy::Halt => {
                warn!(projector = M::NAME, event = %id, error = %error, "fold failed, halting refresh");
                Err(FoldFailure::new(envelope, error))
            }
            FoldFailurePolicy::SkipPoison => {
                warn!(projector = M::NAME, event = %id, error = %error, "skipping poison event");
                warnings.push(format!("skipped poison event {id} ({}): {error}", envelope.event_type()));
                self.poison.insert(id.clone());
                state
                    .skip(envelope)
                    .map_err(|e| FoldFailure::new(envelope, e))
            }
        }
    }

    /// Starting state when nothing is cached: the stored snapshot if it is
    /// usable, else the projector's initial payload.
    async fn restore(&mut self) -> MultiProjectionState<M::Payload> {
        let envelope = match self.snapshots.load(M::NAME).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return MultiProjectionState::initial::<M>(),
            Err(err) => {
                warn!(projector = M::NAME, error = %err, "snapshot load failed, rebuilding");
                return MultiProjectionState::initial::<M>();
            }
        };

        if envelope.payload_version() != M::PAYLOAD_VERSION {
            warn!(
                projector = M::NAME,
                stored = envelope.payload_version(),
                current = M::PAYLOAD_VERSION,
                "snapshot payload version mismatch, rebuilding"
            );
            return MultiProjectionState::initial::<M>();
        }

        match envelope.unpack::<M>(self.blobs.as_ref()).await {
            Ok(mut state) => {
                state.mark_snapshot_applied();
                self.persisted = Persisted {
                    safe_id: envelope.safe_sortable_unique_id().cloned(),
                    safe_version: state.version(),
                    blob_key: envelope.blob_key().cloned(),
                    at: Instant::now(),
                };
                self.prune_poison();
                debug!(
                    projector = M::NAME,
                    safe_version = state.version(),
                    offloaded = envelope.is_offloaded(),
                    "restored from snapshot"
                );
                state
            }
            Err(err) => {
                warn!(projector = M::NAME, error = %err, "snapshot unreadable, rebuilding");
                MultiProjectionState::initial::<M>()
            }
        }
    }

    /// Snapshot the safe state once it has moved past the last snapshot by a
    /// full batch, or by anything after the persist interval. A superseded
    /// blob is deleted after the new envelope is saved.
    async fn persist(&mut self, safe: &MultiProjectionState<M::Payload>) {
        let Some(safe_id) = safe.last_sortable_unique_id() else {
            return;
        };
        if self.persisted.safe_id.as_ref().is_some_and(|persisted| persisted >= safe_id) {
            return;
        }
        let pending = safe.version().saturating_sub(self.persisted.safe_version);
        if pending < self.config.persist_batch_size
            && self.persisted.at.elapsed() < self.config.persist_interval()
        {
            debug!(projector = M::NAME, pending, "snapshot deferred");
            return;
        }

        let threshold = self.config.snapshot_offload_threshold_bytes;
        let envelope = match SnapshotEnvelope::pack::<M>(safe, threshold, self.blobs.as_ref()).await {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(projector = M::NAME, safe_id = %safe_id, error = %err, "snapshot persist failed");
                return;
            }
        };
        let blob_key = envelope.blob_key().cloned();
        let size_bytes = envelope.size_bytes();
        let compressed_bytes = envelope.compressed_bytes();

        if let Err(err) = self.snapshots.save(envelope).await {
            warn!(projector = M::NAME, safe_id = %safe_id, error = %err, "snapshot persist failed");
            if let Some(orphan) = &blob_key {
                self.delete_blob(orphan).await;
            }
            return;
        }
        info!(
            projector = M::NAME,
            safe_id = %safe_id,
            safe_version = safe.version(),
            size_bytes,
            compressed_bytes,
            offloaded = blob_key.is_some(),
            "snapshot persisted"
        );

        let superseded = std::mem::replace(
            &mut self.persisted,
            Persisted {
                safe_id: Some(safe_id.clone()),
                safe_version: safe.version(),
                blob_key,
                at: Instant::now(),
            },
        );
        if let Some(old) = superseded.blob_key
            && self.persisted.blob_key.as_ref() != Some(&old)
        {
            self.delete_blob(&old).await;
        }
        self.prune_poison();
    }

    async fn delete_blob(&self, key: &BlobKey) {
        if let Err(err) = self.blobs.delete(key).await {
            warn!(projector = M::NAME, blob = %key, error = %err, "snapshot blob delete failed");
        }
    }

    /// Poison at or before the snapshot is never read again.
    fn prune_poison(&mut self) {
        if let Some(persisted) = &self.persisted.safe_id {
            self.poison.retain(|id| id > persisted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeDelta, Utc};
    use foldwise_cart::{CART_GROUP, CartEvent, CartStatus, CartSummaries, CartSummaryProjector};
    use foldwise_core::{ExpectedVersion, ManualClock, PartitionKeys, SortableIdGenerator};
    use foldwise_events::{EventMetadata, EventSelector};

    use crate::blob_store::InMemoryBlobStore;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};
    use crate::snapshot::InMemorySnapshotStore;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000, 0).unwrap()
    }

    struct Fixture {
        clock: ManualClock,
        ids: SortableIdGenerator,
        store: Arc<InMemoryEventStore>,
        blobs: Arc<InMemoryBlobStore>,
        snapshots: Arc<InMemorySnapshotStore>,
        config: EngineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new(start());
            Self {
                ids: SortableIdGenerator::new(Arc::new(clock.clone())),
                clock,
                store: Arc::new(InMemoryEventStore::new()),
                blobs: Arc::new(InMemoryBlobStore::new()),
                snapshots: Arc::new(InMemorySnapshotStore::new()),
                config: EngineConfig::default(),
            }
        }

        fn engine<M: MultiProjector>(&self) -> MultiProjectionEngine<M> {
            MultiProjectionEngine::new(
                self.store.clone(),
                self.blobs.clone(),
                self.snapshots.clone(),
                Arc::new(self.clock.clone()),
                self.config.clone(),
            )
        }

        async fn append(&self, keys: &PartitionKeys, event: CartEvent) -> EventEnvelope {
            let event = UncommittedEvent::from_typed(&event, self.ids.next_id(), EventMetadata::default())
                .unwrap();
            self.store
                .append_if_version(keys, ExpectedVersion::Any, vec![event])
                .await
                .unwrap()
                .remove(0)
        }

        async fn snapshot_version(&self) -> Option<u64> {
            self.snapshots
                .load(CartSummaryProjector::NAME)
                .await
                .unwrap()
                .map(|s| s.safe_version())
        }

        async fn new_cart(&self, owner: &str) -> PartitionKeys {
            let keys = PartitionKeys::generate(CART_GROUP);
            self.append(&keys, CartEvent::CartCreated { owner: owner.to_string() }).await;
            keys
        }
    }

    fn item() -> CartEvent {
        CartEvent::ItemAdded {
            sku: "sku".to_string(),
            quantity: 1,
            unit_price_cents: 100,
        }
    }

    #[tokio::test]
    async fn recent_events_stay_unsafe_until_the_window_passes() {
        let fx = Fixture::new();
        let cart = fx.new_cart("alice").await;
        fx.clock.advance(TimeDelta::seconds(30));
        fx.append(&cart, item()).await;
        fx.clock.advance(TimeDelta::seconds(2));

        let mut engine = fx.engine::<CartSummaryProjector>();
        let view = engine.refresh().await.unwrap();

        assert_eq!(view.safe_version(), 1);
        assert_eq!(view.unsafe_version(), 1);
        assert_eq!(view.state().payload().carts[&cart.aggregate_id()].item_count, 1);
        assert!(view.warnings().is_empty());

        fx.clock.advance(TimeDelta::seconds(10));
        engine.mark_dirty();
        let view = engine.refresh().await.unwrap();
        assert_eq!(view.safe_version(), 2);
        assert_eq!(view.unsafe_version(), 0);
        assert_eq!(view.safe_sortable_unique_id(), view.last_sortable_unique_id());
    }

    #[tokio::test]
    async fn safe_state_is_snapshotted_once_per_advance() {
        let fx = Fixture::new();
        fx.new_cart("alice").await;
        fx.clock.advance(TimeDelta::seconds(60));

        let mut engine = fx.engine::<CartSummaryProjector>();
        let view = engine.refresh().await.unwrap();

        let snapshot = fx.snapshots.load(CartSummaryProjector::NAME).await.unwrap().unwrap();
        assert_eq!(snapshot.safe_version(), 1);
        assert_eq!(snapshot.safe_sortable_unique_id(), view.safe_sortable_unique_id());
        assert!(!snapshot.is_offloaded());
        assert!(fx.blobs.is_empty());
    }

    #[tokio::test]
    async fn large_snapshots_are_offloaded() {
        let mut fx = Fixture::new();
        fx.config.snapshot_offload_threshold_bytes = 64;
        for n in 0..5 {
            fx.new_cart(&format!("owner-{n}")).await;
        }
        fx.clock.advance(TimeDelta::seconds(60));

        fx.engine::<CartSummaryProjector>().refresh().await.unwrap();

        let snapshot = fx.snapshots.load(CartSummaryProjector::NAME).await.unwrap().unwrap();
        assert!(snapshot.is_offloaded());
        assert_eq!(fx.blobs.len(), 1);
        assert!(
            snapshot
                .blob_key()
                .unwrap()
                .as_str()
                .starts_with("cart_summary/1/")
        );
    }

    #[tokio::test]
    async fn superseded_snapshot_blobs_are_deleted() {
        let mut fx = Fixture::new();
        fx.config.snapshot_offload_threshold_bytes = 64;
        let mut engine = fx.engine::<CartSummaryProjector>();

        for n in 0..5 {
            fx.new_cart(&format!("owner-{n}")).await;
            fx.clock.advance(TimeDelta::seconds(60));
            engine.mark_dirty();
            let view = engine.refresh().await.unwrap();

            let snapshot = fx.snapshots.load(CartSummaryProjector::NAME).await.unwrap().unwrap();
            assert_eq!(snapshot.safe_version(), view.safe_version());
            assert!(snapshot.is_offloaded());
            assert_eq!(fx.blobs.len(), 1, "after advance {n}");
        }

        let cold = fx.engine::<CartSummaryProjector>().refresh().await.unwrap();
        assert_eq!(cold.state().applied_snapshot_version(), 5);
        assert_eq!(cold.state().payload().carts.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_waits_for_a_batch_or_the_interval() {
        let mut fx = Fixture::new();
        fx.config.persist_batch_size = 3;
        fx.config.persist_interval_ms = 60_000;
        let mut engine = fx.engine::<CartSummaryProjector>();

        fx.new_cart("a").await;
        fx.new_cart("b").await;
        fx.clock.advance(TimeDelta::seconds(60));
        assert_eq!(engine.refresh().await.unwrap().safe_version(), 2);
        assert_eq!(fx.snapshot_version().await, None);

        fx.new_cart("c").await;
        fx.clock.advance(TimeDelta::seconds(60));
        engine.mark_dirty();
        engine.refresh().await.unwrap();
        assert_eq!(fx.snapshot_version().await, Some(3));

        fx.new_cart("d").await;
        fx.clock.advance(TimeDelta::seconds(60));
        engine.mark_dirty();
        assert_eq!(engine.refresh().await.unwrap().safe_version(), 4);
        assert_eq!(fx.snapshot_version().await, Some(3));

        tokio::time::advance(Duration::from_secs(61)).await;
        engine.mark_dirty();
        engine.refresh().await.unwrap();
        assert_eq!(fx.snapshot_version().await, Some(4));
    }

    #[tokio::test]
    async fn cold_start_resumes_from_the_snapshot() {
        let mut fx = Fixture::new();
        fx.config.snapshot_offload_threshold_bytes = 64;
        let a = fx.new_cart("a").await;
        fx.append(&a, item()).await;
        fx.new_cart("b").await;
        fx.clock.advance(TimeDelta::seconds(60));
        let warm = fx.engine::<CartSummaryProjector>().refresh().await.unwrap();

        fx.append(&a, item()).await;
        fx.clock.advance(TimeDelta::seconds(60));
        let mut cold = fx.engine::<CartSummaryProjector>();
        let view = cold.refresh().await.unwrap();

        assert_eq!(view.state().applied_snapshot_version(), warm.safe_version());
        assert_eq!(view.safe_version(), 4);
        assert_eq!(view.state().payload().carts[&a.aggregate_id()].item_count, 2);

        let events: Vec<_> = fx
            .store
            .read_by_group(EventSelector::all(), None)
            .map(|e| e.unwrap())
            .collect()
            .await;
        let rebuilt = MultiProjectionState::rebuild_from_scratch::<CartSummaryProjector>(&events).unwrap();
        assert_eq!(rebuilt.payload(), view.state().payload());
    }

    /// Same name, new payload shape.
    struct CartSummaryV2;

    impl MultiProjector for CartSummaryV2 {
        type Payload = CartSummaries;
        const NAME: &'static str = CartSummaryProjector::NAME;
        const PAYLOAD_VERSION: u32 = 2;

        fn selector() -> EventSelector {
            CartSummaryProjector::selector()
        }

        fn initial() -> CartSummaries {
            CartSummaryProjector::initial()
        }

        fn project(payload: &mut CartSummaries, event: &EventEnvelope) -> Result<(), ProjectionError> {
            CartSummaryProjector::project(payload, event)
        }
    }

    #[tokio::test]
    async fn snapshot_of_another_payload_version_is_a_miss() {
        let fx = Fixture::new();
        fx.new_cart("a").await;
        fx.clock.advance(TimeDelta::seconds(60));
        fx.engine::<CartSummaryProjector>().refresh().await.unwrap();

        let view = fx.engine::<CartSummaryV2>().refresh().await.unwrap();

        assert_eq!(view.state().applied_snapshot_version(), 0);
        assert_eq!(view.safe_version(), 1);
        let snapshot = fx.snapshots.load(CartSummaryProjector::NAME).await.unwrap().unwrap();
        assert_eq!(snapshot.payload_version(), 2);
    }

    #[tokio::test]
    async fn halt_policy_serves_the_last_good_state_and_retries() {
        let fx = Fixture::new();
        let good = fx.new_cart("a").await;
        let orphan = PartitionKeys::generate(CART_GROUP);
        let bad = fx.append(&orphan, item()).await;
        fx.append(&good, item()).await;
        fx.clock.advance(TimeDelta::seconds(60));

        let mut engine = fx.engine::<CartSummaryProjector>();
        let view = engine.refresh().await.unwrap();

        assert_eq!(view.safe_version(), 1);
        assert_eq!(view.state().payload().carts[&good.aggregate_id()].item_count, 0);
        let failure = view.fold_failure().unwrap();
        assert_eq!(failure.sortable_unique_id, *bad.sortable_unique_id());
        assert!(matches!(failure.error, ProjectionError::Rejected { .. }));
        assert_eq!(view.warnings().len(), 1);

        engine.mark_dirty();
        let again = engine.refresh().await.unwrap();
        assert!(again.fold_failure().is_some());
        assert!(engine.poisoned().is_empty());
    }

    #[tokio::test]
    async fn skip_policy_records_poison_and_moves_on() {
        let mut fx = Fixture::new();
        fx.config.fold_failure_policy = FoldFailurePolicy::SkipPoison;
        fx.config.persist_batch_size = 100;
        let good = fx.new_cart("a").await;
        let bad = fx.append(&PartitionKeys::generate(CART_GROUP), item()).await;
        fx.append(&good, item()).await;
        fx.clock.advance(TimeDelta::seconds(60));

        let mut engine = fx.engine::<CartSummaryProjector>();
        let view = engine.refresh().await.unwrap();

        assert_eq!(view.safe_version(), 3);
        assert!(view.fold_failure().is_none());
        assert_eq!(view.warnings().len(), 1);
        assert_eq!(view.state().payload().carts[&good.aggregate_id()].item_count, 1);
        assert!(engine.poisoned().contains(bad.sortable_unique_id()));

        fx.append(&good, CartEvent::CartCheckedOut { total_cents: 100 }).await;
        fx.clock.advance(TimeDelta::seconds(60));
        engine.mark_dirty();
        let view = engine.refresh().await.unwrap();
        assert!(view.warnings().is_empty());
        assert_eq!(
            view.state().payload().carts[&good.aggregate_id()].status,
            CartStatus::CheckedOut
        );
    }

    #[tokio::test]
    async fn poison_is_pruned_once_a_snapshot_moves_past_it() {
        let mut fx = Fixture::new();
        fx.config.fold_failure_policy = FoldFailurePolicy::SkipPoison;
        fx.new_cart("a").await;
        fx.clock.advance(TimeDelta::seconds(60));
        let bad = fx.append(&PartitionKeys::generate(CART_GROUP), item()).await;
        fx.clock.advance(TimeDelta::seconds(2));

        let mut engine = fx.engine::<CartSummaryProjector>();
        let view = engine.refresh().await.unwrap();
        assert_eq!(view.safe_version(), 1);
        assert_eq!(view.warnings().len(), 1);
        assert!(engine.poisoned().contains(bad.sortable_unique_id()));

        fx.clock.advance(TimeDelta::seconds(60));
        engine.mark_dirty();
        let view = engine.refresh().await.unwrap();
        assert_eq!(view.safe_version(), 2);
        assert!(view.warnings().is_empty());
        assert!(engine.poisoned().is_empty());

        let snapshot = fx.snapshots.load(CartSummaryProjector::NAME).await.unwrap().unwrap();
        assert_eq!(snapshot.safe_sortable_unique_id(), Some(bad.sortable_unique_id()));
    }

    #[tokio::test]
    async fn unsafe_tail_failure_degrades_to_the_safe_state() {
        let fx = Fixture::new();
        let good = fx.new_cart("a").await;
        fx.clock.advance(TimeDelta::seconds(60));
        fx.append(&PartitionKeys::generate(CART_GROUP), item()).await;

        let view = fx.engine::<CartSummaryProjector>().refresh().await.unwrap();

        assert_eq!(view.safe_version(), 1);
        assert_eq!(view.unsafe_version(), 0);
        assert!(view.fold_failure().is_some());
        assert!(view.state().payload().carts.contains_key(&good.aggregate_id()));
    }

    #[tokio::test]
    async fn needs_refresh_tracks_dirtiness_and_waits() {
        let fx = Fixture::new();
        let cart = fx.new_cart("a").await;
        let mut engine = fx.engine::<CartSummaryProjector>();
        assert!(engine.needs_refresh(None));

        let view = engine.refresh().await.unwrap();
        assert!(!engine.needs_refresh(None));
        assert!(!engine.needs_refresh(view.last_sortable_unique_id()));

        let later = fx.append(&cart, item()).await;
        assert!(engine.needs_refresh(Some(later.sortable_unique_id())));

        engine.mark_dirty();
        assert!(engine.needs_refresh(None));
        let view = engine.refresh().await.unwrap();
        assert!(view.covers(later.sortable_unique_id()));

        engine.invalidate();
        assert!(engine.view().is_none());
        assert!(engine.needs_refresh(None));
    }

    #[tokio::test]
    async fn refresh_without_new_events_reuses_the_view() {
        let fx = Fixture::new();
        fx.new_cart("a").await;
        fx.clock.advance(TimeDelta::seconds(60));
        let mut engine = fx.engine::<CartSummaryProjector>();

        let first = engine.refresh().await.unwrap();
        let second = engine.refresh().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
