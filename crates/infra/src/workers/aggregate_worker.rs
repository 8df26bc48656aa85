//! Worker that owns one aggregate stream and executes its commands.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, info, info_span};

use foldwise_core::{Aggregate, AggregateProjector, PartitionKeys};
use foldwise_events::{Command, DomainEvent, EventMetadata};

use crate::command_executor::{CommandError, CommandExecutor, CommandResponse};
use crate::event_store::EventStore;
use crate::workers::WorkerHandle;

pub(crate) type SharedExecutor = CommandExecutor<Arc<dyn EventStore>>;

type CommandReply = oneshot::Sender<Result<CommandResponse, CommandError>>;

/// A command of any type targeting `Pr`'s aggregates, with its reply channel.
#[async_trait]
pub(crate) trait PendingCommand<Pr: AggregateProjector>: Send {
    async fn run(
        self: Box<Self>,
        executor: &SharedExecutor,
        cache: &mut Option<Aggregate<Pr::Payload>>,
    );
}

struct Pending<C> {
    command: C,
    metadata: EventMetadata,
    reply: CommandReply,
}

#[async_trait]
impl<C> PendingCommand<C::Projector> for Pending<C>
where
    C: Command,
    <C::Projector as AggregateProjector>::Event: DomainEvent,
{
    async fn run(
        self: Box<Self>,
        executor: &SharedExecutor,
        cache: &mut Option<Aggregate<<C::Projector as AggregateProjector>::Payload>>,
    ) {
        let span = info_span!(
            "execute_command",
            command = std::any::type_name::<C>(),
            partition = %self.command.partition_keys(),
        );
        let result = executor
            .execute(&self.command, &self.metadata, cache)
            .instrument(span)
            .await;
        // The caller may have given up; nothing to do then.
        let _ = self.reply.send(result);
    }
}

pub(crate) enum AggregateMessage<Pr: AggregateProjector> {
    Execute(Box<dyn PendingCommand<Pr>>),
    GetAggregate {
        reply: oneshot::Sender<Result<Aggregate<Pr::Payload>, CommandError>>,
    },
    #[allow(dead_code)] // Sent only in tests.
    Shutdown,
}

/// Async handle to a running aggregate worker.
#[derive(Debug)]
pub struct AggregateHandle<Pr: AggregateProjector> {
    sender: mpsc::Sender<AggregateMessage<Pr>>,
}

// Manual `Clone`: the projector type itself is never cloned.
impl<Pr: AggregateProjector> Clone for AggregateHandle<Pr> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<Pr> AggregateHandle<Pr>
where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    /// Queue `command`; `None` if the worker had already shut down.
    pub(crate) async fn submit<C>(
        &self,
        command: C,
        metadata: EventMetadata,
    ) -> Option<oneshot::Receiver<Result<CommandResponse, CommandError>>>
    where
        C: Command<Projector = Pr>,
    {
        let (reply, rx) = oneshot::channel();
        let pending = Pending {
            command,
            metadata,
            reply,
        };
        self.sender
            .send(AggregateMessage::Execute(Box::new(pending)))
            .await
            .ok()?;
        Some(rx)
    }

    pub async fn execute<C>(
        &self,
        command: C,
        metadata: EventMetadata,
    ) -> Result<CommandResponse, CommandError>
    where
        C: Command<Projector = Pr>,
    {
        let rx = self
            .submit(command, metadata)
            .await
            .ok_or(CommandError::WorkerGone)?;
        rx.await.map_err(|_| CommandError::WorkerGone)?
    }

    /// Current aggregate, caught up with the store.
    pub async fn aggregate(&self) -> Result<Aggregate<Pr::Payload>, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(AggregateMessage::GetAggregate { reply })
            .await
            .map_err(|_| CommandError::WorkerGone)?;
        rx.await.map_err(|_| CommandError::WorkerGone)?
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl<Pr> WorkerHandle for AggregateHandle<Pr>
where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    fn is_alive(&self) -> bool {
        AggregateHandle::is_alive(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn spawn_aggregate_worker<Pr>(
    executor: SharedExecutor,
    partition_keys: PartitionKeys,
    idle_timeout: Duration,
    inbox_capacity: usize,
) -> AggregateHandle<Pr>
where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    let (sender, rx) = mpsc::channel(inbox_capacity.max(1));
    tokio::spawn(run_aggregate_worker::<Pr>(executor, partition_keys, rx, idle_timeout));
    AggregateHandle { sender }
}

async fn run_aggregate_worker<Pr>(
    executor: SharedExecutor,
    partition_keys: PartitionKeys,
    mut rx: mpsc::Receiver<AggregateMessage<Pr>>,
    idle_timeout: Duration,
) where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    let mut cache: Option<Aggregate<Pr::Payload>> = None;

    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(AggregateMessage::Shutdown)) | Ok(None) => break,
            Ok(Some(message)) => handle_message::<Pr>(&executor, &partition_keys, &mut cache, message).await,
            Err(_elapsed) => {
                info!(
                    projector = Pr::NAME,
                    partition = %partition_keys,
                    "aggregate worker idle, shutting down"
                );
                // Refuse new messages, then serve what was already queued.
                rx.close();
                while let Some(message) = rx.recv().await {
                    handle_message::<Pr>(&executor, &partition_keys, &mut cache, message).await;
                }
                break;
            }
        }
    }
}

async fn handle_message<Pr>(
    executor: &SharedExecutor,
    partition_keys: &PartitionKeys,
    cache: &mut Option<Aggregate<Pr::Payload>>,
    message: AggregateMessage<Pr>,
) where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    match message {
        AggregateMessage::Execute(pending) => pending.run(executor, cache).await,
        AggregateMessage::GetAggregate { reply } => {
            let result = executor
                .load_aggregate::<Pr>(partition_keys, cache.take())
                .await;
            if let Ok(aggregate) = &result {
                *cache = Some(aggregate.clone());
            }
            let _ = reply.send(result);
        }
        AggregateMessage::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldwise_cart::{AddItem, CartPayload, CartProjector, CreateCart};
    use foldwise_core::SortableIdGenerator;

    use crate::event_store::InMemoryEventStore;

    fn executor() -> SharedExecutor {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        CommandExecutor::new(store, Arc::new(SortableIdGenerator::system()), 3)
    }

    #[tokio::test]
    async fn worker_serializes_commands_for_its_stream() {
        let create = CreateCart::new("alice");
        let keys = create.partition_keys();
        let handle = spawn_aggregate_worker::<CartProjector>(
            executor(),
            keys.clone(),
            Duration::from_secs(60),
            8,
        );

        handle.execute(create, EventMetadata::default()).await.unwrap();
        let adds: Vec<_> = (0..5)
            .map(|n| {
                let handle = handle.clone();
                let add = AddItem::new(keys.aggregate_id(), format!("sku-{n}"), 1, 100);
                tokio::spawn(async move { handle.execute(add, EventMetadata::default()).await })
            })
            .collect();
        for add in adds {
            add.await.unwrap().unwrap();
        }

        let aggregate = handle.aggregate().await.unwrap();
        assert_eq!(aggregate.version(), 6);
        let CartPayload::Active(cart) = aggregate.payload() else {
            panic!("cart should be active");
        };
        assert_eq!(cart.items.len(), 5);
    }

    #[tokio::test]
    async fn shutdown_closes_the_handle() {
        let keys = CreateCart::new("bob").partition_keys();
        let handle = spawn_aggregate_worker::<CartProjector>(
            executor(),
            keys,
            Duration::from_secs(60),
            8,
        );
        assert!(handle.is_alive());

        handle.sender.send(AggregateMessage::Shutdown).await.unwrap();
        handle.sender.closed().await;

        assert!(!handle.is_alive());
        assert!(matches!(handle.aggregate().await, Err(CommandError::WorkerGone)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_worker_shuts_itself_down() {
        let keys = CreateCart::new("carol").partition_keys();
        let handle = spawn_aggregate_worker::<CartProjector>(
            executor(),
            keys,
            Duration::from_millis(50),
            8,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.sender.closed().await;
        assert!(!handle.is_alive());
    }
}
