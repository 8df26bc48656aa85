//! Worker that owns one multi-projection and serves its views.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug, info, info_span, warn};

use foldwise_core::SortableUniqueId;
use foldwise_events::{MultiProjector, Subscription, UpdateNotice};

use crate::multi_projection::{MultiProjectionEngine, ProjectionRefreshError, ProjectionView};
use crate::workers::WorkerHandle;

type ViewResult<P> = Result<Arc<ProjectionView<P>>, ProjectionRefreshError>;

pub(crate) enum ProjectionMessage<P> {
    /// A view that is fresh enough, refreshing first if needed.
    View {
        wait_for: Option<SortableUniqueId>,
        reply: oneshot::Sender<ViewResult<P>>,
    },
    /// Refresh now regardless of freshness.
    Refresh { reply: oneshot::Sender<ViewResult<P>> },
    Invalidate,
    /// Stop without draining the inbox.
    #[allow(dead_code)] // Only tests send it.
    Shutdown,
}

pub(crate) struct ProjectionWorkerConfig {
    pub idle_timeout: Duration,
    pub refresh_timeout: Duration,
    pub inbox_capacity: usize,
}

/// Async handle to a running projection worker.
pub struct ProjectionHandle<M: MultiProjector> {
    sender: mpsc::Sender<ProjectionMessage<M::Payload>>,
}

impl<M: MultiProjector> Clone for ProjectionHandle<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<M: MultiProjector> ProjectionHandle<M> {
    pub async fn view(&self, wait_for: Option<SortableUniqueId>) -> ViewResult<M::Payload> {
        let (reply, rx) = oneshot::channel();
        self.request(ProjectionMessage::View { wait_for, reply }, rx).await
    }

    pub async fn refresh(&self) -> ViewResult<M::Payload> {
        let (reply, rx) = oneshot::channel();
        self.request(ProjectionMessage::Refresh { reply }, rx).await
    }

    /// Drop the cached state; the next view rebuilds it.
    pub async fn invalidate(&self) -> Result<(), ProjectionRefreshError> {
        self.sender
            .send(ProjectionMessage::Invalidate)
            .await
            .map_err(|_| ProjectionRefreshError::WorkerGone(M::NAME))
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn request(
        &self,
        message: ProjectionMessage<M::Payload>,
        rx: oneshot::Receiver<ViewResult<M::Payload>>,
    ) -> ViewResult<M::Payload> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ProjectionRefreshError::WorkerGone(M::NAME))?;
        rx.await
            .map_err(|_| ProjectionRefreshError::WorkerGone(M::NAME))?
    }
}

impl<M: MultiProjector> WorkerHandle for ProjectionHandle<M> {
    fn is_alive(&self) -> bool {
        ProjectionHandle::is_alive(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn spawn_projection_worker<M: MultiProjector>(
    engine: MultiProjectionEngine<M>,
    notices: Subscription<UpdateNotice>,
    config: ProjectionWorkerConfig,
) -> ProjectionHandle<M> {
    let (sender, rx) = mpsc::channel(config.inbox_capacity.max(1));
    tokio::spawn(run_projection_worker(engine, rx, notices, config));
    ProjectionHandle { sender }
}

/// Inbox messages and matching notices both count as activity for the idle
/// timer.
async fn run_projection_worker<M: MultiProjector>(
    mut engine: MultiProjectionEngine<M>,
    mut rx: mpsc::Receiver<ProjectionMessage<M::Payload>>,
    mut notices: Subscription<UpdateNotice>,
    config: ProjectionWorkerConfig,
) {
    let selector = M::selector();
    let mut notices_open = true;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(ProjectionMessage::Shutdown) | None => break,
                Some(message) => handle_message(&mut engine, message, config.refresh_timeout).await,
            },
            notice = notices.recv(), if notices_open => match notice {
                Some(notice) if selector.matches_notice(&notice) => {
                    let coalesced = notices.drain();
                    debug!(
                        projector = M::NAME,
                        group = %notice.group,
                        at = %notice.sortable_unique_id,
                        coalesced,
                        "update notice, cache marked dirty"
                    );
                    engine.mark_dirty();
                }
                Some(_) => {}
                None => notices_open = false,
            },
            () = tokio::time::sleep(config.idle_timeout) => {
                info!(projector = M::NAME, "projection worker idle, shutting down");
                rx.close();
                while let Some(message) = rx.recv().await {
                    handle_message(&mut engine, message, config.refresh_timeout).await;
                }
                break;
            }
        }
    }
}

async fn handle_message<M: MultiProjector>(
    engine: &mut MultiProjectionEngine<M>,
    message: ProjectionMessage<M::Payload>,
    refresh_timeout: Duration,
) {
    match message {
        ProjectionMessage::View { wait_for, reply } => {
            let cached = if engine.needs_refresh(wait_for.as_ref()) {
                None
            } else {
                engine.view().cloned()
            };
            let result = match cached {
                Some(view) => Ok(view),
                None => refresh(engine, refresh_timeout).await,
            };
            let _ = reply.send(result);
        }
        ProjectionMessage::Refresh { reply } => {
            engine.mark_dirty();
            let _ = reply.send(refresh(engine, refresh_timeout).await);
        }
        ProjectionMessage::Invalidate => engine.invalidate(),
        ProjectionMessage::Shutdown => {}
    }
}

/// Refresh bounded by `timeout`. On timeout the previous view is served with
/// a warning; without one the timeout is an error.
async fn refresh<M: MultiProjector>(
    engine: &mut MultiProjectionEngine<M>,
    timeout: Duration,
) -> ViewResult<M::Payload> {
    let span = info_span!("refresh_projection", projector = M::NAME);
    let outcome = tokio::time::timeout(timeout, engine.refresh().instrument(span)).await;
    match outcome {
        Ok(result) => result,
        Err(_elapsed) => {
            warn!(projector = M::NAME, ?timeout, "projection refresh timed out");
            match engine.view() {
                Some(view) => Ok(Arc::new(view.degraded(format!(
                    "projection '{}' refresh timed out after {timeout:?}, serving the previous view",
                    M::NAME
                )))),
                None => Err(ProjectionRefreshError::TimedOut {
                    projector: M::NAME,
                    after: timeout,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use futures::StreamExt;
    use foldwise_cart::{CART_GROUP, CartEvent, CartSummaryProjector};
    use foldwise_core::{Clock, ExpectedVersion, ManualClock, PartitionKeys, SortableIdGenerator};
    use foldwise_events::{EventBus, EventEnvelope, EventMetadata, EventSelector, InMemoryEventBus};

    use crate::blob_store::InMemoryBlobStore;
    use crate::config::EngineConfig;
    use crate::event_store::{
        EventStore, EventStoreError, EventStream, InMemoryEventStore, NotifyingEventStore, UncommittedEvent,
    };
    use crate::snapshot::InMemorySnapshotStore;

    struct Fixture {
        clock: ManualClock,
        ids: SortableIdGenerator,
        bus: Arc<InMemoryEventBus<UpdateNotice>>,
        store: Arc<dyn EventStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new(chrono::Utc::now());
            let bus = Arc::new(InMemoryEventBus::new());
            let store: Arc<dyn EventStore> =
                Arc::new(NotifyingEventStore::new(InMemoryEventStore::new(), bus.clone()));
            Self {
                ids: SortableIdGenerator::new(Arc::new(clock.clone())),
                clock,
                bus,
                store,
            }
        }

        fn spawn(&self, idle_timeout: Duration) -> ProjectionHandle<CartSummaryProjector> {
            self.spawn_over(self.store.clone(), idle_timeout, Duration::from_secs(5))
        }

        fn spawn_over(
            &self,
            store: Arc<dyn EventStore>,
            idle_timeout: Duration,
            refresh_timeout: Duration,
        ) -> ProjectionHandle<CartSummaryProjector> {
            let engine = MultiProjectionEngine::new(
                store,
                Arc::new(InMemoryBlobStore::new()),
                Arc::new(InMemorySnapshotStore::new()),
                Arc::new(self.clock.clone()) as Arc<dyn Clock>,
                EngineConfig {
                    // Only notices (or waits) trigger refreshes.
                    cache_ttl_ms: 3_600_000,
                    ..EngineConfig::default()
                },
            );
            spawn_projection_worker(
                engine,
                self.bus.subscribe(),
                ProjectionWorkerConfig {
                    idle_timeout,
                    refresh_timeout,
                    inbox_capacity: 8,
                },
            )
        }

        async fn create_cart(&self, owner: &str) -> (PartitionKeys, SortableUniqueId) {
            let keys = PartitionKeys::generate(CART_GROUP);
            let event = UncommittedEvent::from_typed(
                &CartEvent::CartCreated { owner: owner.to_string() },
                self.ids.next_id(),
                EventMetadata::default(),
            )
            .unwrap();
            let committed = self
                .store
                .append_if_version(&keys, ExpectedVersion::Exact(0), vec![event])
                .await
                .unwrap();
            (keys, committed[0].sortable_unique_id().clone())
        }
    }

    /// Group reads that stall for `delay` before yielding while `slow` is set.
    struct SlowReads {
        inner: Arc<dyn EventStore>,
        delay: Duration,
        slow: AtomicBool,
    }

    #[async_trait]
    impl EventStore for SlowReads {
        async fn append_if_version(
            &self,
            partition_keys: &PartitionKeys,
            expected: ExpectedVersion,
            events: Vec<UncommittedEvent>,
        ) -> Result<Vec<EventEnvelope>, EventStoreError> {
            self.inner.append_if_version(partition_keys, expected, events).await
        }

        fn read_stream(&self, partition_keys: PartitionKeys, from_version: u64) -> EventStream<'_> {
            self.inner.read_stream(partition_keys, from_version)
        }

        fn read_by_group(&self, selector: EventSelector, after: Option<SortableUniqueId>) -> EventStream<'_> {
            let events = self.inner.read_by_group(selector, after);
            if !self.slow.load(Ordering::SeqCst) {
                return events;
            }
            let delay = self.delay;
            futures::stream::once(async move {
                tokio::time::sleep(delay).await;
                events
            })
            .flatten()
            .boxed()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn notices_make_the_next_view_fresh() {
        let fx = Fixture::new();
        let handle = fx.spawn(Duration::from_secs(60));
        assert!(handle.view(None).await.unwrap().state().payload().carts.is_empty());

        fx.create_cart("alice").await;
        settle().await;
        // Worker processes the notice before the next inbox message.
        let view = handle.view(None).await.unwrap();
        assert_eq!(view.state().payload().carts.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_refreshes_past_the_cached_view() {
        let fx = Fixture::new();
        let handle = fx.spawn(Duration::from_secs(60));
        handle.view(None).await.unwrap();

        let (_, id) = fx.create_cart("bob").await;
        let view = handle.view(Some(id.clone())).await.unwrap();
        assert!(view.covers(&id));
    }

    #[tokio::test]
    async fn invalidate_rebuilds_on_next_view() {
        let fx = Fixture::new();
        let handle = fx.spawn(Duration::from_secs(60));
        fx.create_cart("carol").await;
        fx.clock.advance(TimeDelta::seconds(30));
        let before = handle.refresh().await.unwrap();

        handle.invalidate().await.unwrap();
        let after = handle.view(None).await.unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.state().payload(), before.state().payload());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_serves_the_previous_view_then_recovers() {
        let fx = Fixture::new();
        let store = Arc::new(SlowReads {
            inner: fx.store.clone(),
            delay: Duration::from_secs(10),
            slow: AtomicBool::new(false),
        });
        let handle = fx.spawn_over(store.clone(), Duration::from_secs(600), Duration::from_secs(1));
        fx.create_cart("alice").await;
        let before = handle.refresh().await.unwrap();
        assert_eq!(before.state().payload().carts.len(), 1);
        assert!(before.warnings().is_empty());

        store.slow.store(true, Ordering::SeqCst);
        fx.create_cart("bob").await;
        let stale = handle.refresh().await.unwrap();
        assert_eq!(stale.state().payload(), before.state().payload());
        assert_eq!(stale.warnings().len(), 1);
        assert!(stale.warnings()[0].contains("timed out"));

        store.slow.store(false, Ordering::SeqCst);
        let fresh = handle.refresh().await.unwrap();
        assert_eq!(fresh.state().payload().carts.len(), 2);
        assert!(fresh.warnings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_without_a_view_is_an_error() {
        let fx = Fixture::new();
        let store = Arc::new(SlowReads {
            inner: fx.store.clone(),
            delay: Duration::from_secs(10),
            slow: AtomicBool::new(true),
        });
        let handle = fx.spawn_over(store, Duration::from_secs(600), Duration::from_secs(1));

        let err = handle.view(None).await.unwrap_err();
        assert_eq!(
            err,
            ProjectionRefreshError::TimedOut {
                projector: "cart_summary",
                after: Duration::from_secs(1),
            }
        );
    }

    #[tokio::test]
    async fn shutdown_closes_the_handle() {
        let fx = Fixture::new();
        let handle = fx.spawn(Duration::from_secs(60));
        handle.view(None).await.unwrap();

        handle.sender.send(ProjectionMessage::Shutdown).await.unwrap();
        handle.sender.closed().await;

        assert!(!handle.is_alive());
        assert!(matches!(
            handle.refresh().await,
            Err(ProjectionRefreshError::WorkerGone("cart_summary"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_shuts_down_and_reports_gone() {
        let fx = Fixture::new();
        let handle = fx.spawn(Duration::from_millis(50));
        handle.view(None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.sender.closed().await;

        assert!(!handle.is_alive());
        assert!(matches!(
            handle.view(None).await,
            Err(ProjectionRefreshError::WorkerGone("cart_summary"))
        ));
    }
}
