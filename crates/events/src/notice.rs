use serde::{Deserialize, Serialize};

use foldwise_core::SortableUniqueId;

use crate::envelope::EventEnvelope;

/// "Stream group `group` in `root_partition_key` changed at `sortable_unique_id`."
///
/// Notices only prompt caches to refresh early; losing one costs freshness,
/// never correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotice {
    pub group: String,
    pub root_partition_key: String,
    pub sortable_unique_id: SortableUniqueId,
}

impl UpdateNotice {
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            group: envelope.partition_keys().group().to_string(),
            root_partition_key: envelope.partition_keys().root_partition_key().to_string(),
            sortable_unique_id: envelope.sortable_unique_id().clone(),
        }
    }
}
