use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use foldwise_core::{EventId, ExpectedVersion, PartitionKeys, SortableUniqueId};
use foldwise_events::{DomainEvent, EventEnvelope, EventMetadata, EventSelector};
use std::sync::Arc;

/// An event ready to be appended (not yet assigned a stream version).
///
/// The writer assigns `sortable_unique_id` before the append; the store
/// assigns `version`. Use [`UncommittedEvent::from_typed`] to build one from a
/// typed domain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub id: EventId,
    pub sortable_unique_id: SortableUniqueId,
    pub event_type: String,
    pub metadata: EventMetadata,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Serialize a typed event, capturing its tag for later decoding.
    pub fn from_typed<E: DomainEvent>(
        event: &E,
        sortable_unique_id: SortableUniqueId,
        metadata: EventMetadata,
    ) -> Result<Self, EventStoreError> {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::Serialization(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            id: EventId::new(),
            sortable_unique_id,
            event_type: event.event_type().to_string(),
            metadata,
            payload,
        })
    }

    /// Attach the stream position assigned by the store.
    pub fn commit(self, partition_keys: PartitionKeys, version: u64) -> EventEnvelope {
        EventEnvelope::new(
            self.id,
            self.sortable_unique_id,
            self.event_type,
            partition_keys,
            version,
            self.metadata,
            self.payload,
        )
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// The stream moved since it was read.
    #[error("optimistic concurrency check failed (expected: {expected:?}, actual: {actual})")]
    Concurrency {
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Lazily produced events; consumers pull with bounded memory.
pub type EventStream<'a> = BoxStream<'a, Result<EventEnvelope, EventStoreError>>;

/// Append-only, partitioned event store.
///
/// ## Design Principles
///
/// - **No storage assumptions**: works with the in-memory implementation
///   (tests/dev) and any SQL/NoSQL backend
/// - **Optimistic locking**: compare-and-append on the stream version is the
///   only concurrency control; there are no locks across calls
/// - **Append-only**: events are never modified or deleted
///
/// ## Append Semantics
///
/// `append_if_version()`:
/// - checks the stream's current version against `expected`
/// - assigns versions `current + 1 ..` in batch order
/// - persists the batch atomically (all or nothing)
///
/// ## Read Semantics
///
/// - `read_stream()` yields one stream in version order, from `from_version`
///   (1-based, inclusive)
/// - `read_by_group()` yields every event matching the selector in
///   `SortableUniqueId` order, strictly after `after`
///
/// Reads are streams so a large history never has to sit in memory at once.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_if_version(
        &self,
        partition_keys: &PartitionKeys,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError>;

    fn read_stream(&self, partition_keys: PartitionKeys, from_version: u64) -> EventStream<'_>;

    fn read_by_group(
        &self,
        selector: EventSelector,
        after: Option<SortableUniqueId>,
    ) -> EventStream<'_>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append_if_version(
        &self,
        partition_keys: &PartitionKeys,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        (**self).append_if_version(partition_keys, expected, events).await
    }

    fn read_stream(&self, partition_keys: PartitionKeys, from_version: u64) -> EventStream<'_> {
        (**self).read_stream(partition_keys, from_version)
    }

    fn read_by_group(
        &self,
        selector: EventSelector,
        after: Option<SortableUniqueId>,
    ) -> EventStream<'_> {
        (**self).read_by_group(selector, after)
    }
}
