use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use foldwise_core::{EventId, PartitionKeys, SortableUniqueId};

use crate::error::EventDecodeError;
use crate::event::DomainEvent;

/// Who and what caused an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub executed_by: Option<String>,
}

impl EventMetadata {
    pub fn executed_by(user: impl Into<String>) -> Self {
        Self {
            executed_by: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// A committed event, as stored in and read back from a stream.
///
/// Notes:
/// - **Append-only**: `version` is the 1-based position in the partition's stream.
/// - **Global order** is given by `sortable_unique_id`, not by `version`.
/// - `payload` is the JSON form of the typed event; `event_type` is its tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: EventId,
    sortable_unique_id: SortableUniqueId,
    event_type: String,
    partition_keys: PartitionKeys,
    version: u64,
    metadata: EventMetadata,
    payload: JsonValue,
}

impl EventEnvelope {
    pub fn new(
        id: EventId,
        sortable_unique_id: SortableUniqueId,
        event_type: impl Into<String>,
        partition_keys: PartitionKeys,
        version: u64,
        metadata: EventMetadata,
        payload: JsonValue,
    ) -> Self {
        Self {
            id,
            sortable_unique_id,
            event_type: event_type.into(),
            partition_keys,
            version,
            metadata,
            payload,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn sortable_unique_id(&self) -> &SortableUniqueId {
        &self.sortable_unique_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn partition_keys(&self) -> &PartitionKeys {
        &self.partition_keys
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload as `E`.
    ///
    /// Returns `Ok(None)` when the tag is not one of `E::EVENT_TYPES`, and an
    /// error when the tag is known but the payload does not match it.
    pub fn decode<E: DomainEvent>(&self) -> Result<Option<E>, EventDecodeError> {
        if !E::EVENT_TYPES.contains(&self.event_type.as_str()) {
            return Ok(None);
        }
        E::deserialize(&self.payload)
            .map(Some)
            .map_err(|e| EventDecodeError {
                event_type: self.event_type.clone(),
                sortable_unique_id: self.sortable_unique_id.clone(),
                message: e.to_string(),
            })
    }
}
