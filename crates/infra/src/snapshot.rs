//! Multi-projection snapshots: inline when small, offloaded to a blob when large.
//!
//! The offload decision is made on the gzip-compressed size; offloaded blobs
//! hold the compressed bytes, inline state stays plain JSON.
//!
//! A [`SnapshotEnvelope`] always carries exactly one of `inline_state` or
//! `blob_key`. Envelopes that break this (or whose payload version does not
//! match the projector any more) are treated as absent by the loader; the
//! projection is then rebuilt from the event store.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::RwLock;

use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use foldwise_core::{EventId, SortableUniqueId};
use foldwise_events::{MultiProjectionState, MultiProjector};

use crate::blob_store::{BlobKey, BlobStore, BlobStoreError};

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The envelope is structurally invalid.
    #[error("corrupt snapshot for '{projector}': {reason}")]
    Corrupt { projector: String, reason: String },

    #[error(transparent)]
    Blob(#[from] BlobStoreError),

    #[error("snapshot serialization failed: {0}")]
    Serialization(String),

    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    projector_name: String,
    payload_version: u32,
    safe_sortable_unique_id: Option<SortableUniqueId>,
    safe_version: u64,
    last_event_id: Option<EventId>,
    size_bytes: usize,
    compressed_bytes: usize,
    is_offloaded: bool,
    inline_state: Option<JsonValue>,
    blob_key: Option<BlobKey>,
}

impl SnapshotEnvelope {
    pub fn projector_name(&self) -> &str {
        &self.projector_name
    }

    pub fn payload_version(&self) -> u32 {
        self.payload_version
    }

    pub fn safe_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.safe_sortable_unique_id.as_ref()
    }

    pub fn safe_version(&self) -> u64 {
        self.safe_version
    }

    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id
    }

    /// Serialized JSON size before compression.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn compressed_bytes(&self) -> usize {
        self.compressed_bytes
    }

    pub fn is_offloaded(&self) -> bool {
        self.is_offloaded
    }

    pub fn inline_state(&self) -> Option<&JsonValue> {
        self.inline_state.as_ref()
    }

    pub fn blob_key(&self) -> Option<&BlobKey> {
        self.blob_key.as_ref()
    }

    /// Exactly one of inline state / blob key, consistent with `is_offloaded`.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        let consistent = match (self.is_offloaded, &self.inline_state, &self.blob_key) {
            (false, Some(_), None) => true,
            (true, None, Some(_)) => true,
            _ => false,
        };
        if consistent {
            Ok(())
        } else {
            Err(SnapshotError::Corrupt {
                projector: self.projector_name.clone(),
                reason: format!(
                    "is_offloaded={} inline_state={} blob_key={}",
                    self.is_offloaded,
                    self.inline_state.is_some(),
                    self.blob_key.is_some()
                ),
            })
        }
    }

    /// Serialize `state`, offloading it to `blobs` when its compressed form
    /// exceeds `threshold_bytes`.
    pub async fn pack<M>(
        state: &MultiProjectionState<M::Payload>,
        threshold_bytes: usize,
        blobs: &dyn BlobStore,
    ) -> Result<Self, SnapshotError>
    where
        M: MultiProjector,
    {
        let value = serde_json::to_value(state)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let bytes =
            serde_json::to_vec(&value).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        let compressed = gzip(&bytes).map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let mut envelope = Self {
            projector_name: M::NAME.to_string(),
            payload_version: M::PAYLOAD_VERSION,
            safe_sortable_unique_id: state.last_sortable_unique_id().cloned(),
            safe_version: state.version(),
            last_event_id: state.last_event_id(),
            size_bytes: bytes.len(),
            compressed_bytes: compressed.len(),
            is_offloaded: false,
            inline_state: None,
            blob_key: None,
        };

        if compressed.len() > threshold_bytes {
            let label = format!("{}/{}", M::NAME, M::PAYLOAD_VERSION);
            let mut body: &[u8] = &compressed;
            envelope.blob_key = Some(blobs.write(&label, &mut body).await?);
            envelope.is_offloaded = true;
        } else {
            envelope.inline_state = Some(value);
        }
        Ok(envelope)
    }

    /// Restore the state this envelope describes, reading the blob if needed.
    pub async fn unpack<M>(
        &self,
        blobs: &dyn BlobStore,
    ) -> Result<MultiProjectionState<M::Payload>, SnapshotError>
    where
        M: MultiProjector,
    {
        self.validate()?;
        let corrupt = |reason: String| SnapshotError::Corrupt {
            projector: self.projector_name.clone(),
            reason,
        };

        match (&self.inline_state, &self.blob_key) {
            (Some(inline), _) => {
                MultiProjectionState::deserialize(inline).map_err(|e| corrupt(e.to_string()))
            }
            (None, Some(key)) => {
                let mut reader = blobs.open_read(key).await?;
                let mut compressed = Vec::with_capacity(self.compressed_bytes);
                reader
                    .read_to_end(&mut compressed)
                    .await
                    .map_err(BlobStoreError::from)?;
                let mut bytes = Vec::with_capacity(self.size_bytes);
                GzDecoder::new(compressed.as_slice())
                    .read_to_end(&mut bytes)
                    .map_err(|e| corrupt(format!("gzip: {e}")))?;
                serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))
            }
            (None, None) => Err(corrupt("no state".to_string())),
        }
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Record store for snapshot envelopes, one per projector name.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, projector_name: &str) -> Result<Option<SnapshotEnvelope>, SnapshotError>;

    async fn save(&self, envelope: SnapshotEnvelope) -> Result<(), SnapshotError>;
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    envelopes: RwLock<HashMap<String, SnapshotEnvelope>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, projector_name: &str) -> Result<Option<SnapshotEnvelope>, SnapshotError> {
        let envelopes = self
            .envelopes
            .read()
            .map_err(|_| SnapshotError::Unavailable("lock poisoned".to_string()))?;
        Ok(envelopes.get(projector_name).cloned())
    }

    async fn save(&self, envelope: SnapshotEnvelope) -> Result<(), SnapshotError> {
        envelope.validate()?;
        self.envelopes
            .write()
            .map_err(|_| SnapshotError::Unavailable("lock poisoned".to_string()))?
            .insert(envelope.projector_name.clone(), envelope);
        Ok(())
    }
}
