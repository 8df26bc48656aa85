//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Resolve partition keys
//!   ↓
//! 2. Load aggregate (cached state + newer events, or full replay)
//!   ↓
//! 3. Decide (expected-version check, then the pure handler)
//!   ↓
//! 4. Append with ExpectedVersion::Exact(loaded version)
//!      └─ version race lost → back to 2 (bounded attempts)
//!   ↓
//! 5. Fold the committed events into the cached aggregate
//! ```
//!
//! Only a lost append race is retried. Validation failures, client-side
//! version mismatches and store errors are returned as they are.

use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use foldwise_core::{
    Aggregate, AggregatePayload, AggregateProjector, DomainError, ExpectedVersion, PartitionKeys, SortableIdGenerator,
    SortableUniqueId,
};
use foldwise_events::{
    Command, DomainEvent, EventEnvelope, EventMetadata, PayloadOf, ReplayError, decide,
    fold_envelope,
};

use crate::event_store::{EventStore, EventStoreError, UncommittedEvent};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The handler rejected the command. Never retried.
    #[error("command rejected: {0}")]
    Validation(DomainError),

    /// The stream moved: either the caller's expected version is stale or
    /// every append attempt lost the race.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stored events could not be replayed (undecodable known event, gap).
    #[error("corrupt stream {partition}: {reason}")]
    CorruptStream { partition: String, reason: String },

    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Store(EventStoreError),

    #[error("aggregate worker is no longer running")]
    WorkerGone,
}

impl CommandError {
    fn from_domain(err: DomainError, partition_keys: &PartitionKeys) -> Self {
        match err {
            DomainError::Conflict(msg) => CommandError::ConcurrencyConflict(msg),
            DomainError::NotFound => CommandError::NotFound(partition_keys.to_string()),
            other => CommandError::Validation(other),
        }
    }

    fn corrupt(partition_keys: &PartitionKeys, err: ReplayError) -> Self {
        CommandError::CorruptStream {
            partition: partition_keys.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<EventStoreError> for CommandError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency { expected, actual } => CommandError::ConcurrencyConflict(
                format!("expected {expected:?}, stream is at {actual}"),
            ),
            EventStoreError::Unavailable(msg) => CommandError::StoreUnavailable(msg),
            other => CommandError::Store(other),
        }
    }
}

/// Outcome of a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub partition_keys: PartitionKeys,
    /// Stream version after the command (unchanged if no events were emitted).
    pub version: u64,
    pub events: Vec<EventEnvelope>,
}

impl CommandResponse {
    /// Id of the last emitted event; feed it to `wait_for_sortable_unique_id`
    /// to read your own write.
    pub fn last_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.events.last().map(|e| e.sortable_unique_id())
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// The executor is stateless; the per-stream aggregate cache is owned by the
/// caller (the aggregate worker) and passed in on each call.
#[derive(Debug, Clone)]
pub struct CommandExecutor<S> {
    store: S,
    ids: Arc<SortableIdGenerator>,
    max_attempts: u32,
}

impl<S: EventStore> CommandExecutor<S> {
    pub fn new(store: S, ids: Arc<SortableIdGenerator>, max_attempts: u32) -> Self {
        Self {
            store,
            ids,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current aggregate for `partition_keys`.
    ///
    /// A cached aggregate for the same stream is caught up with the events
    /// after its version; if that fails (gap, reorder) it is discarded and the
    /// stream is replayed from the start.
    pub async fn load_aggregate<Pr>(
        &self,
        partition_keys: &PartitionKeys,
        cached: Option<Aggregate<Pr::Payload>>,
    ) -> Result<Aggregate<Pr::Payload>, CommandError>
    where
        Pr: AggregateProjector,
        Pr::Event: DomainEvent,
    {
        if let Some(mut aggregate) = cached.filter(|a| a.partition_keys() == partition_keys) {
            match self.catch_up::<Pr>(&mut aggregate).await {
                Ok(()) => return Ok(aggregate),
                Err(CommandError::CorruptStream { reason, .. }) => {
                    debug!(partition = %partition_keys, %reason, "cached aggregate out of step, replaying");
                }
                Err(other) => return Err(other),
            }
        }

        let mut aggregate = Aggregate::empty(partition_keys.clone());
        self.catch_up::<Pr>(&mut aggregate).await?;
        Ok(aggregate)
    }

    async fn catch_up<Pr>(&self, aggregate: &mut Aggregate<Pr::Payload>) -> Result<(), CommandError>
    where
        Pr: AggregateProjector,
        Pr::Event: DomainEvent,
    {
        let partition_keys = aggregate.partition_keys().clone();
        let mut events = self
            .store
            .read_stream(partition_keys.clone(), aggregate.version() + 1);
        while let Some(envelope) = events.next().await {
            let envelope = envelope?;
            fold_envelope::<Pr>(aggregate, &envelope)
                .map_err(|e| CommandError::corrupt(&partition_keys, e))?;
        }
        Ok(())
    }

    /// Run `command` through the full pipeline.
    ///
    /// `cache` holds the worker's last known aggregate for this stream; it is
    /// read at the start and refreshed on the way out.
    pub async fn execute<C>(
        &self,
        command: &C,
        metadata: &EventMetadata,
        cache: &mut Option<Aggregate<PayloadOf<C>>>,
    ) -> Result<CommandResponse, CommandError>
    where
        C: Command,
        <C::Projector as AggregateProjector>::Event: DomainEvent,
    {
        let partition_keys = command.partition_keys();
        let mut attempt = 1;

        loop {
            let mut aggregate = self
                .load_aggregate::<C::Projector>(&partition_keys, cache.take())
                .await?;

            let decided = decide(command, &aggregate);
            let events = match decided {
                Ok(events) => events,
                Err(err) => {
                    *cache = Some(aggregate);
                    return Err(CommandError::from_domain(err, &partition_keys));
                }
            };

            if events.is_empty() {
                let version = aggregate.version();
                *cache = Some(aggregate);
                return Ok(CommandResponse {
                    partition_keys,
                    version,
                    events: vec![],
                });
            }

            let uncommitted = events
                .iter()
                .map(|event| UncommittedEvent::from_typed(event, self.ids.next_id(), metadata.clone()))
                .collect::<Result<Vec<_>, _>>()?;

            let expected = ExpectedVersion::Exact(aggregate.version());
            match self
                .store
                .append_if_version(&partition_keys, expected, uncommitted)
                .await
            {
                Ok(committed) => {
                    for (event, envelope) in events.iter().zip(&committed) {
                        aggregate
                            .apply::<C::Projector>(
                                Some(event),
                                envelope.version(),
                                envelope.sortable_unique_id(),
                            )
                            .map_err(|e| {
                                CommandError::corrupt(&partition_keys, ReplayError::Inconsistent(e))
                            })?;
                    }
                    let version = aggregate.version();
                    info!(
                        partition = %partition_keys,
                        version,
                        count = committed.len(),
                        payload = aggregate.payload().variant_name(),
                        "events appended"
                    );
                    *cache = Some(aggregate);
                    return Ok(CommandResponse {
                        partition_keys,
                        version,
                        events: committed,
                    });
                }
                Err(EventStoreError::Concurrency { actual, .. }) if attempt < self.max_attempts => {
                    info!(
                        partition = %partition_keys,
                        attempt,
                        loaded = aggregate.version(),
                        actual,
                        "append lost the version race, retrying"
                    );
                    *cache = Some(aggregate);
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
