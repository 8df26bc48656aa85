use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed domain event.
///
/// Events are facts: immutable and append-only. Implementors are usually
/// enums serialized in adjacently tagged form
/// (`#[serde(tag = "type", content = "data")]`) so the stored payload carries
/// its own tag.
///
/// `EVENT_TYPES` is the static registry of every tag the type can decode.
/// Envelopes whose `event_type` is not listed belong to some other event
/// family and are folded as no-ops.
pub trait DomainEvent:
    Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const EVENT_TYPES: &'static [&'static str];

    /// Stable tag for this value; must be one of `EVENT_TYPES`.
    fn event_type(&self) -> &'static str;
}
