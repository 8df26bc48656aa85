//! Append-only event store boundary.
//!
//! This module defines an infrastructure-facing abstraction for storing and
//! reading partitioned event streams without making any storage assumptions.

pub mod in_memory;
pub mod r#trait;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use foldwise_core::{ExpectedVersion, PartitionKeys, SortableUniqueId};
use foldwise_events::{EventBus, EventEnvelope, EventSelector, UpdateNotice};

pub use in_memory::{DEFAULT_READ_BATCH_SIZE, InMemoryEventStore};
pub use r#trait::{EventStore, EventStoreError, EventStream, UncommittedEvent};

/// Adapter that publishes an [`UpdateNotice`] after every successful append.
///
/// This ensures the ordering invariant: **notices go out only after the
/// append is durable**. A failed publish is logged and otherwise ignored;
/// caches then catch up on their next pull.
pub struct NotifyingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> NotifyingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

/// One notice per (group, root partition), carrying the latest id.
fn notices_for(committed: &[EventEnvelope]) -> Vec<UpdateNotice> {
    let mut latest: BTreeMap<(&str, &str), &EventEnvelope> = BTreeMap::new();
    for envelope in committed {
        let keys = envelope.partition_keys();
        latest
            .entry((keys.group(), keys.root_partition_key()))
            .and_modify(|seen| {
                if envelope.sortable_unique_id() > seen.sortable_unique_id() {
                    *seen = envelope;
                }
            })
            .or_insert(envelope);
    }
    latest.into_values().map(UpdateNotice::from_envelope).collect()
}

#[async_trait]
impl<S, B> EventStore for NotifyingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<UpdateNotice>,
{
    async fn append_if_version(
        &self,
        partition_keys: &PartitionKeys,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        // 1) Append (durable step)
        let committed = self
            .store
            .append_if_version(partition_keys, expected, events)
            .await?;

        // 2) Notify (best-effort)
        for notice in notices_for(&committed) {
            if let Err(err) = self.bus.publish(notice) {
                warn!(partition = %partition_keys, error = %err, "update notice dropped");
            }
        }

        Ok(committed)
    }

    fn read_stream(&self, partition_keys: PartitionKeys, from_version: u64) -> EventStream<'_> {
        self.store.read_stream(partition_keys, from_version)
    }

    fn read_by_group(
        &self,
        selector: EventSelector,
        after: Option<SortableUniqueId>,
    ) -> EventStream<'_> {
        self.store.read_by_group(selector, after)
    }
}
