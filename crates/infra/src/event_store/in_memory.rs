use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::{StreamExt, stream};

use foldwise_core::{ExpectedVersion, PartitionKeys, SortableUniqueId};
use foldwise_events::{EventEnvelope, EventSelector};

use super::r#trait::{EventStore, EventStoreError, EventStream, UncommittedEvent};

/// Default number of events handed out per read batch.
pub const DEFAULT_READ_BATCH_SIZE: usize = 1000;

#[derive(Debug, Default)]
struct Log {
    streams: HashMap<PartitionKeys, Vec<Arc<EventEnvelope>>>,
    /// Every event, in global order.
    global: BTreeMap<SortableUniqueId, Arc<EventEnvelope>>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev and single-process deployments. Reads are served in
/// batches of `batch_size`; the lock is only held while a batch is copied out,
/// so long reads never block writers.
#[derive(Debug)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
    batch_size: usize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::with_batch_size(DEFAULT_READ_BATCH_SIZE)
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            log: RwLock::new(Log::default()),
            batch_size: batch_size.max(1),
        }
    }

    /// Total number of committed events across all streams.
    pub fn event_count(&self) -> usize {
        self.log.read().map(|log| log.global.len()).unwrap_or(0)
    }

    fn current_version(stream: &[Arc<EventEnvelope>]) -> u64 {
        stream.last().map(|e| e.version()).unwrap_or(0)
    }

    fn stream_batch(
        &self,
        partition_keys: &PartitionKeys,
        from_version: u64,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let Some(stream) = log.streams.get(partition_keys) else {
            return Ok(vec![]);
        };
        let start = (from_version.saturating_sub(1) as usize).min(stream.len());
        Ok(stream[start..]
            .iter()
            .take(self.batch_size)
            .map(|e| e.as_ref().clone())
            .collect())
    }

    /// Scan up to `batch_size` global entries after `after`.
    ///
    /// Returns the matching events and the last scanned id (`None` when the
    /// scan found nothing, i.e. the end of the log).
    #[allow(clippy::type_complexity)]
    fn group_batch(
        &self,
        selector: &EventSelector,
        after: Option<&SortableUniqueId>,
    ) -> Result<(Vec<EventEnvelope>, Option<SortableUniqueId>), EventStoreError> {
        let log = self
            .log
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };

        let mut matched = Vec::new();
        let mut last_scanned = None;
        for (id, envelope) in log
            .global
            .range((lower, Bound::Unbounded))
            .take(self.batch_size)
        {
            if selector.matches(envelope.partition_keys()) {
                matched.push(envelope.as_ref().clone());
            }
            last_scanned = Some(id.clone());
        }
        Ok((matched, last_scanned))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_if_version(
        &self,
        partition_keys: &PartitionKeys,
        expected: ExpectedVersion,
        events: Vec<UncommittedEvent>,
    ) -> Result<Vec<EventEnvelope>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut log = self
            .log
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        let current = log
            .streams
            .get(partition_keys)
            .map(|s| Self::current_version(s))
            .unwrap_or(0);

        if !expected.matches(current) {
            return Err(EventStoreError::Concurrency {
                expected,
                actual: current,
            });
        }

        for (idx, e) in events.iter().enumerate() {
            if log.global.contains_key(&e.sortable_unique_id)
                || events[..idx]
                    .iter()
                    .any(|earlier| earlier.sortable_unique_id == e.sortable_unique_id)
            {
                return Err(EventStoreError::InvalidAppend(format!(
                    "duplicate sortable id {} (index {idx})",
                    e.sortable_unique_id
                )));
            }
        }

        // Assign versions and append (append-only, all or nothing).
        let committed: Vec<EventEnvelope> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, version)| e.commit(partition_keys.clone(), version))
            .collect();

        for envelope in &committed {
            let shared = Arc::new(envelope.clone());
            log.global
                .insert(envelope.sortable_unique_id().clone(), shared.clone());
            log.streams
                .entry(partition_keys.clone())
                .or_default()
                .push(shared);
        }

        Ok(committed)
    }

    fn read_stream(&self, partition_keys: PartitionKeys, from_version: u64) -> EventStream<'_> {
        stream::unfold(Some(from_version.max(1)), move |cursor| {
            let partition_keys = partition_keys.clone();
            async move {
                let next = cursor?;
                match self.stream_batch(&partition_keys, next) {
                    Err(e) => Some((vec![Err(e)], None)),
                    Ok(batch) if batch.is_empty() => None,
                    Ok(batch) => {
                        let following = next + batch.len() as u64;
                        Some((batch.into_iter().map(Ok).collect(), Some(following)))
                    }
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    fn read_by_group(
        &self,
        selector: EventSelector,
        after: Option<SortableUniqueId>,
    ) -> EventStream<'_> {
        stream::unfold(Some(after), move |cursor| {
            let selector = selector.clone();
            async move {
                let after = cursor?;
                match self.group_batch(&selector, after.as_ref()) {
                    Err(e) => Some((vec![Err(e)], None)),
                    Ok((_, None)) => None,
                    Ok((batch, Some(last))) => Some((
                        batch.into_iter().map(Ok).collect::<Vec<_>>(),
                        Some(Some(last)),
                    )),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}
