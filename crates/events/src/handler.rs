//! Pure command decisions and aggregate replay (no IO, no async).

use thiserror::Error;

use foldwise_core::{Aggregate, AggregateProjector, DomainError, DomainResult, PartitionKeys};

use crate::command::{Command, EventOf, PayloadOf};
use crate::envelope::EventEnvelope;
use crate::error::EventDecodeError;
use crate::event::DomainEvent;

/// A stream could not be replayed into an aggregate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error(transparent)]
    Decode(#[from] EventDecodeError),

    /// Gaps, reordering, or events from a different stream.
    #[error("inconsistent stream: {0}")]
    Inconsistent(DomainError),
}

/// Check the command's version expectation, then run its handler.
pub fn decide<C: Command>(
    command: &C,
    aggregate: &Aggregate<PayloadOf<C>>,
) -> DomainResult<Vec<EventOf<C>>> {
    command.expected_version().check(aggregate.version())?;
    command.handle(aggregate)
}

/// Fold one committed envelope into an aggregate.
///
/// Unknown event types advance the version without touching the payload.
pub fn fold_envelope<Pr>(
    aggregate: &mut Aggregate<Pr::Payload>,
    envelope: &EventEnvelope,
) -> Result<(), ReplayError>
where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    if envelope.partition_keys() != aggregate.partition_keys() {
        return Err(ReplayError::Inconsistent(DomainError::invariant(format!(
            "event for {} found in stream {}",
            envelope.partition_keys(),
            aggregate.partition_keys()
        ))));
    }
    let event = envelope.decode::<Pr::Event>()?;
    aggregate
        .apply::<Pr>(event.as_ref(), envelope.version(), envelope.sortable_unique_id())
        .map_err(ReplayError::Inconsistent)
}

/// Rebuild an aggregate from its full history.
pub fn replay<'a, Pr>(
    partition_keys: PartitionKeys,
    history: impl IntoIterator<Item = &'a EventEnvelope>,
) -> Result<Aggregate<Pr::Payload>, ReplayError>
where
    Pr: AggregateProjector,
    Pr::Event: DomainEvent,
{
    let mut aggregate = Aggregate::empty(partition_keys);
    for envelope in history {
        fold_envelope::<Pr>(&mut aggregate, envelope)?;
    }
    Ok(aggregate)
}
