use foldwise_core::{Aggregate, AggregateProjector, DomainResult, ExpectedVersion, PartitionKeys};

/// Payload type of the aggregate a command targets.
pub type PayloadOf<C> = <<C as Command>::Projector as AggregateProjector>::Payload;

/// Event type a command emits.
pub type EventOf<C> = <<C as Command>::Projector as AggregateProjector>::Event;

/// A command targets exactly one aggregate stream.
///
/// Commands represent **intent**; they are transient and turn into events
/// (which are persisted) or into a rejection.
///
/// ## Routing
///
/// `partition_keys()` must be a deterministic function of the command's
/// fields: "existing entity X" commands name X, "new entity" commands carry
/// freshly generated keys. The engine routes on these keys, so every command
/// for one stream is handled by the same worker.
///
/// ## Concurrency
///
/// `expected_version()` lets a client assert the version it last read. A
/// mismatch is reported as a conflict immediately; the engine does not retry
/// it because that would discard the caller's assertion. The default is
/// [`ExpectedVersion::Any`], which still gets optimistic protection at append
/// time (with bounded internal retries).
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Projector: AggregateProjector;

    fn partition_keys(&self) -> PartitionKeys;

    fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Any
    }

    /// Decide which events to emit given the current aggregate.
    ///
    /// Must be pure: no IO, no clock reads that influence the decision
    /// beyond what the command itself carries.
    fn handle(&self, aggregate: &Aggregate<PayloadOf<Self>>) -> DomainResult<Vec<EventOf<Self>>>;
}
