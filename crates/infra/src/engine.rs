//! The engine: wiring plus the public command and query API.
//!
//! ```text
//!   execute_command ──► aggregate worker (one per stream) ──► event store
//!                                                               │
//!                                               update notice ◄─┘
//!                                                     │
//!   execute_query ────► projection worker (one per projector) ──► view
//! ```
//!
//! Workers are spawned on first use and kept in a registry keyed by
//! `(TypeId, key)`. A worker that idled out is evicted and respawned
//! transparently.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use foldwise_core::{
    Aggregate, AggregateProjector, Clock, PartitionKeys, SortableIdGenerator, SortableUniqueId,
    SystemClock,
};
use foldwise_events::{
    Command, DomainEvent, EventBus, EventMetadata, EventOf, InMemoryEventBus,
    MultiProjectionListQuery, MultiProjectionQuery, MultiProjector, Subscription, UpdateNotice,
};

use crate::blob_store::{BlobStore, InMemoryBlobStore};
use crate::command_executor::{CommandError, CommandExecutor, CommandResponse};
use crate::config::{ConfigError, EngineConfig};
use crate::event_store::{EventStore, InMemoryEventStore, NotifyingEventStore};
use crate::multi_projection::{MultiProjectionEngine, ProjectionRefreshError, ProjectionView};
use crate::query::{
    ListQueryResult, QueryError, QueryOptions, QueryResult, check_page, run_list_query, run_query,
};
use crate::snapshot::{InMemorySnapshotStore, SnapshotStore};
use crate::workers::aggregate_worker::spawn_aggregate_worker;
use crate::workers::projection_worker::{ProjectionWorkerConfig, spawn_projection_worker};
use crate::workers::{AggregateHandle, ProjectionHandle, WorkerHandle};

/// Type-erased handle registry keyed by `(TypeId, key)`.
///
/// `TypeId` names the projector type; the `String` is the stream key for
/// aggregates and the projector name for multi-projections.
type HandleCache = HashMap<(TypeId, String), Box<dyn WorkerHandle>>;

type Shared<P> = Arc<ProjectionView<P>>;

struct EngineInner {
    store: Arc<dyn EventStore>,
    blobs: Arc<dyn BlobStore>,
    snapshots: Arc<dyn SnapshotStore>,
    bus: Arc<dyn EventBus<UpdateNotice>>,
    clock: Arc<dyn Clock>,
    ids: Arc<SortableIdGenerator>,
    config: EngineConfig,
    workers: RwLock<HandleCache>,
}

/// Cheap to clone; all clones share the same workers.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The store as seen by the engine (appends publish update notices).
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn subscribe_notices(&self) -> Subscription<UpdateNotice> {
        self.inner.bus.subscribe()
    }

    pub async fn execute_command<C>(&self, command: C) -> Result<CommandResponse, CommandError>
    where
        C: Command,
        EventOf<C>: DomainEvent,
    {
        self.execute_command_with(command, EventMetadata::default())
            .await
    }

    pub async fn execute_command_with<C>(
        &self,
        command: C,
        metadata: EventMetadata,
    ) -> Result<CommandResponse, CommandError>
    where
        C: Command,
        EventOf<C>: DomainEvent,
    {
        let partition_keys = command.partition_keys();
        // Only an undelivered command is resent: once queued it may have run.
        for retried in [false, true] {
            let handle = self.aggregate_handle::<C::Projector>(&partition_keys).await;
            match handle.submit(command.clone(), metadata.clone()).await {
                Some(reply) => return reply.await.map_err(|_| CommandError::WorkerGone)?,
                None if !retried => {
                    debug!(partition = %partition_keys, "aggregate worker gone before delivery, respawning");
                }
                None => {}
            }
        }
        Err(CommandError::WorkerGone)
    }

    /// Current state of one aggregate; `NotFound` if its stream is empty.
    pub async fn load_aggregate<Pr>(
        &self,
        partition_keys: &PartitionKeys,
    ) -> Result<Aggregate<Pr::Payload>, CommandError>
    where
        Pr: AggregateProjector,
        Pr::Event: DomainEvent,
    {
        for retried in [false, true] {
            let handle = self.aggregate_handle::<Pr>(partition_keys).await;
            match handle.aggregate().await {
                Err(CommandError::WorkerGone) if !retried => continue,
                Ok(aggregate) if aggregate.version() == 0 => {
                    return Err(CommandError::NotFound(partition_keys.to_string()));
                }
                other => return other,
            }
        }
        Err(CommandError::WorkerGone)
    }

    pub async fn execute_query<Q>(
        &self,
        query: &Q,
        options: QueryOptions,
    ) -> Result<QueryResult<Q::Output>, QueryError>
    where
        Q: MultiProjectionQuery,
    {
        let (view, warnings) = self
            .resolve_view::<Q::Projector>(options.wait_for_sortable_unique_id.as_ref())
            .await?;
        run_query(query, &view, warnings)
    }

    pub async fn execute_list_query<Q>(
        &self,
        query: &Q,
        options: QueryOptions,
    ) -> Result<ListQueryResult<Q::Item>, QueryError>
    where
        Q: MultiProjectionListQuery,
    {
        check_page(options.page)?;
        let (view, warnings) = self
            .resolve_view::<Q::Projector>(options.wait_for_sortable_unique_id.as_ref())
            .await?;
        run_list_query(query, &view, options.page, warnings)
    }

    /// The materialized view itself, without running a query over it.
    pub async fn projection_state<M: MultiProjector>(
        &self,
        options: QueryOptions,
    ) -> Result<QueryResult<Shared<M::Payload>>, QueryError> {
        let (view, extra) = self
            .resolve_view::<M>(options.wait_for_sortable_unique_id.as_ref())
            .await?;
        let context = view.context();
        let warnings = view.warnings().iter().cloned().chain(extra).collect();
        Ok(QueryResult {
            value: view,
            context,
            warnings,
        })
    }

    /// Refresh now, ignoring the cache TTL.
    pub async fn refresh_projection<M: MultiProjector>(
        &self,
    ) -> Result<Shared<M::Payload>, ProjectionRefreshError> {
        for retried in [false, true] {
            match self.projection_handle::<M>().await.refresh().await {
                Err(ProjectionRefreshError::WorkerGone(_)) if !retried => continue,
                other => return other,
            }
        }
        Err(ProjectionRefreshError::WorkerGone(M::NAME))
    }

    /// Drop the projector's cached state; the next read rebuilds it from the
    /// snapshot store and the event store.
    pub async fn invalidate_projection<M: MultiProjector>(&self) -> Result<(), ProjectionRefreshError> {
        self.projection_handle::<M>().await.invalidate().await
    }

    /// Number of workers currently running.
    pub async fn live_workers(&self) -> usize {
        self.inner
            .workers
            .read()
            .await
            .values()
            .filter(|handle| handle.is_alive())
            .count()
    }

    /// A view satisfying `wait_for` if one shows up within `wait_timeout`.
    ///
    /// On timeout the latest view is returned together with a warning.
    async fn resolve_view<M: MultiProjector>(
        &self,
        wait_for: Option<&SortableUniqueId>,
    ) -> Result<(Shared<M::Payload>, Vec<String>), ProjectionRefreshError> {
        let Some(target) = wait_for else {
            return Ok((self.view_once::<M>(None).await?, Vec::new()));
        };

        let config = &self.inner.config;
        let mut notices = self.inner.bus.subscribe();
        let deadline = Instant::now().checked_add(config.wait_timeout());

        loop {
            let view = self.view_once::<M>(Some(target)).await?;
            if view.covers(target) {
                return Ok((view, Vec::new()));
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(projector = M::NAME, wait_for = %target, "wait for sortable id timed out");
                let warning = format!(
                    "timed out after {:?} waiting for event {target}; the result may be stale",
                    config.wait_timeout()
                );
                return Ok((view, vec![warning]));
            }

            let pause = deadline.map_or(config.wait_poll_interval(), |deadline| {
                (deadline - now).min(config.wait_poll_interval())
            });
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                Some(_) = notices.recv() => {}
            }
        }
    }

    async fn view_once<M: MultiProjector>(
        &self,
        wait_for: Option<&SortableUniqueId>,
    ) -> Result<Shared<M::Payload>, ProjectionRefreshError> {
        for retried in [false, true] {
            match self.projection_handle::<M>().await.view(wait_for.cloned()).await {
                Err(ProjectionRefreshError::WorkerGone(_)) if !retried => continue,
                other => return other,
            }
        }
        Err(ProjectionRefreshError::WorkerGone(M::NAME))
    }

    async fn aggregate_handle<Pr>(&self, partition_keys: &PartitionKeys) -> AggregateHandle<Pr>
    where
        Pr: AggregateProjector,
        Pr::Event: DomainEvent,
    {
        let key = (TypeId::of::<Pr>(), partition_keys.stream_key());
        self.handle(key, || {
            let executor = CommandExecutor::new(
                Arc::clone(&self.inner.store),
                Arc::clone(&self.inner.ids),
                self.inner.config.max_command_retries,
            );
            spawn_aggregate_worker::<Pr>(
                executor,
                partition_keys.clone(),
                self.inner.config.worker_idle_timeout(),
                self.inner.config.worker_inbox_capacity,
            )
        })
        .await
    }

    async fn projection_handle<M: MultiProjector>(&self) -> ProjectionHandle<M> {
        let key = (TypeId::of::<M>(), M::NAME.to_string());
        self.handle(key, || {
            let inner = &self.inner;
            let engine = MultiProjectionEngine::<M>::new(
                Arc::clone(&inner.store),
                Arc::clone(&inner.blobs),
                Arc::clone(&inner.snapshots),
                Arc::clone(&inner.clock),
                inner.config.clone(),
            );
            spawn_projection_worker(
                engine,
                inner.bus.subscribe(),
                ProjectionWorkerConfig {
                    idle_timeout: inner.config.worker_idle_timeout(),
                    refresh_timeout: inner.config.refresh_timeout(),
                    inbox_capacity: inner.config.worker_inbox_capacity,
                },
            )
        })
        .await
    }

    async fn handle<H, F>(&self, key: (TypeId, String), spawn: F) -> H
    where
        H: WorkerHandle + Clone,
        F: FnOnce() -> H,
    {
        // Fast path: live handle under the read lock.
        {
            let workers = self.inner.workers.read().await;
            if let Some(entry) = workers.get(&key)
                && entry.is_alive()
                && let Some(handle) = entry.as_any().downcast_ref::<H>()
            {
                return handle.clone();
            }
        }

        // Slow path: another caller may have respawned it while we waited.
        let mut workers = self.inner.workers.write().await;
        if let Some(entry) = workers.get(&key)
            && entry.is_alive()
            && let Some(handle) = entry.as_any().downcast_ref::<H>()
        {
            return handle.clone();
        }
        workers.retain(|_, handle| handle.is_alive());

        debug!(key = %key.1, "spawning worker");
        let handle = spawn();
        workers.insert(key, Box::new(handle.clone()));
        handle
    }
}

/// Builder for [`Engine`]. Every collaborator defaults to its in-memory
/// implementation.
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn EventStore>>,
    blobs: Option<Arc<dyn BlobStore>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    bus: Option<Arc<dyn EventBus<UpdateNotice>>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw store; the engine wraps it so that appends publish notices.
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus<UpdateNotice>>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(InMemoryEventBus::new()) as Arc<dyn EventBus<UpdateNotice>>);
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InMemoryEventStore::with_batch_size(config.read_batch_size)) as Arc<dyn EventStore>
        });
        let store: Arc<dyn EventStore> = Arc::new(NotifyingEventStore::new(store, Arc::clone(&bus)));

        info!(
            safe_window_ms = config.safe_window_ms,
            max_command_retries = config.max_command_retries,
            fold_failure_policy = ?config.fold_failure_policy,
            "engine started"
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                ids: Arc::new(SortableIdGenerator::new(Arc::clone(&clock))),
                store,
                blobs: self
                    .blobs
                    .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()) as Arc<dyn BlobStore>),
                snapshots: self.snapshots.unwrap_or_else(|| {
                    Arc::new(InMemorySnapshotStore::new()) as Arc<dyn SnapshotStore>
                }),
                bus,
                clock,
                config,
                workers: RwLock::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use foldwise_cart::{AddItem, CartPayload, CartProjector, CreateCart};

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig {
            worker_inbox_capacity: 0,
            ..EngineConfig::default()
        };
        let err = Engine::builder().config(config).build().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "FOLDWISE_WORKER_INBOX_CAPACITY",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn one_worker_per_stream() {
        let engine = Engine::builder().build().unwrap();
        let first = CreateCart::new("a");
        let second = CreateCart::new("b");
        let first_id = first.partition_keys().aggregate_id();

        engine.execute_command(first).await.unwrap();
        engine.execute_command(second).await.unwrap();
        engine
            .execute_command(AddItem::new(first_id, "sku", 1, 10))
            .await
            .unwrap();

        assert_eq!(engine.live_workers().await, 2);
    }

    #[tokio::test]
    async fn load_aggregate_reports_empty_streams_as_not_found() {
        let engine = Engine::builder().build().unwrap();
        let create = CreateCart::new("a");
        let keys = create.partition_keys();

        assert!(matches!(
            engine.load_aggregate::<CartProjector>(&keys).await,
            Err(CommandError::NotFound(_))
        ));

        engine.execute_command(create).await.unwrap();
        let cart = engine.load_aggregate::<CartProjector>(&keys).await.unwrap();
        assert_eq!(cart.version(), 1);
        assert!(matches!(cart.payload(), CartPayload::Active(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_are_respawned_on_demand() {
        let config = EngineConfig {
            worker_idle_timeout_ms: 50,
            ..EngineConfig::default()
        };
        let engine = Engine::builder().config(config).build().unwrap();
        let create = CreateCart::new("a");
        let keys = create.partition_keys();
        engine.execute_command(create).await.unwrap();
        assert_eq!(engine.live_workers().await, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.live_workers().await, 0);

        let response = engine
            .execute_command(AddItem::new(keys.aggregate_id(), "sku", 1, 10))
            .await
            .unwrap();
        assert_eq!(response.version, 2);
        assert_eq!(engine.live_workers().await, 1);
    }
}
