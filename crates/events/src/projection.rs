use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::envelope::EventEnvelope;
use crate::error::ProjectionError;
use crate::selector::EventSelector;

/// A read model folded from events across many streams.
///
/// Multi-projectors implement the **CQRS read side**: they subscribe to a set
/// of stream groups (see [`MultiProjector::selector`]) and fold every matching
/// event, in global `SortableUniqueId` order, into one payload.
///
/// ## Failure
///
/// `project` may refuse an event (malformed payload, broken read-model
/// invariant). On `Err` the payload must be left exactly as it was: validate
/// first, mutate second. The engine then stops folding and decides, per its
/// configured policy, whether to halt or to skip the event.
///
/// ## Disposability
///
/// Read models are **disposable**: the engine can drop the cached payload at
/// any time and rebuild it from the event store. `PAYLOAD_VERSION` must be
/// bumped whenever the payload's serialized shape changes so stale snapshots
/// are ignored instead of misread.
pub trait MultiProjector: Send + Sync + 'static {
    type Payload: Clone
        + core::fmt::Debug
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Stable name; identifies the worker, the snapshot and the log lines.
    const NAME: &'static str;

    const PAYLOAD_VERSION: u32 = 1;

    fn selector() -> EventSelector;

    fn initial() -> Self::Payload;

    fn project(payload: &mut Self::Payload, event: &EventEnvelope) -> Result<(), ProjectionError>;
}
