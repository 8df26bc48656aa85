use thiserror::Error;

use foldwise_core::SortableUniqueId;

/// A stored payload did not decode into the event type its tag promised.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to decode '{event_type}' event {sortable_unique_id}: {message}")]
pub struct EventDecodeError {
    pub event_type: String,
    pub sortable_unique_id: SortableUniqueId,
    pub message: String,
}

/// A multi-projection fold step failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error(transparent)]
    Decode(#[from] EventDecodeError),

    /// The projector refused the event (broken invariant in the read model).
    #[error("'{event_type}' event rejected: {reason}")]
    Rejected { event_type: String, reason: String },

    #[error("non-monotonic event order (last: {last}, found: {found})")]
    NonMonotonic {
        last: SortableUniqueId,
        found: SortableUniqueId,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Publish failed due to internal lock poisoning.
    #[error("event bus lock poisoned")]
    Poisoned,
}
