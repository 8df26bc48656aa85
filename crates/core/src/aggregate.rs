//! Aggregate state and the projector that folds events into it.

use crate::error::{DomainError, DomainResult};
use crate::partition::PartitionKeys;
use crate::sortable_id::SortableUniqueId;

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for idempotent commands, migrations, etc.).
    Any,
    /// Require the stream to be at an exact version (0 = no events yet).
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// State of one aggregate, as a closed set of variants.
///
/// The `empty()` variant is both the initial state of every stream and a
/// legitimate target for "deleted"-style transitions; handlers match on the
/// variant to decide which commands apply.
pub trait AggregatePayload: Clone + core::fmt::Debug + PartialEq + Send + Sync + 'static {
    fn empty() -> Self;

    /// Short variant name for logs.
    fn variant_name(&self) -> &'static str;

    fn is_empty(&self) -> bool {
        *self == Self::empty()
    }
}

/// Pure fold from one aggregate payload to the next.
///
/// Implementations must be deterministic: replaying the same events always
/// yields the same payload. Events that do not concern the current variant
/// leave it unchanged.
pub trait AggregateProjector: Send + Sync + 'static {
    type Payload: AggregatePayload;
    type Event: Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Stable name, used in logs and worker identity.
    const NAME: &'static str;

    fn project(payload: &Self::Payload, event: &Self::Event) -> Self::Payload;
}

/// Current state of one stream: payload plus its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate<P> {
    partition_keys: PartitionKeys,
    payload: P,
    version: u64,
    last_sortable_unique_id: Option<SortableUniqueId>,
}

impl<P: AggregatePayload> Aggregate<P> {
    /// A stream with no events.
    pub fn empty(partition_keys: PartitionKeys) -> Self {
        Self {
            partition_keys,
            payload: P::empty(),
            version: 0,
            last_sortable_unique_id: None,
        }
    }

    pub fn partition_keys(&self) -> &PartitionKeys {
        &self.partition_keys
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn last_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.last_sortable_unique_id.as_ref()
    }

    /// Fold the event at stream position `version`.
    ///
    /// `event` is `None` for event types the projector does not know; those
    /// still advance the version but leave the payload untouched. Positions
    /// must be contiguous.
    pub fn apply<Pr>(
        &mut self,
        event: Option<&Pr::Event>,
        version: u64,
        sortable_unique_id: &SortableUniqueId,
    ) -> DomainResult<()>
    where
        Pr: AggregateProjector<Payload = P>,
    {
        if version != self.version + 1 {
            return Err(DomainError::invariant(format!(
                "non-contiguous stream {}: at version {}, got event {version}",
                self.partition_keys, self.version
            )));
        }

        if let Some(event) = event {
            self.payload = Pr::project(&self.payload, event);
        }
        self.version = version;
        self.last_sortable_unique_id = Some(sortable_unique_id.clone());
        Ok(())
    }
}
