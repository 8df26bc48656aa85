//! Stream identity.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::AggregateId;

/// Root partition used when multi-tenancy is not in play.
pub const DEFAULT_ROOT_PARTITION_KEY: &str = "default";

/// Identifies one append-only event stream.
///
/// The triple is the sharding unit, the worker identity and the cache key.
/// Its canonical text form is `"{root}@{group}@{aggregate_id}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKeys {
    aggregate_id: AggregateId,
    group: String,
    root_partition_key: String,
}

impl PartitionKeys {
    /// Keys for a brand-new aggregate in `group`.
    pub fn generate(group: impl Into<String>) -> Self {
        Self::existing(group, AggregateId::new())
    }

    /// Keys for an aggregate whose id is already known.
    pub fn existing(group: impl Into<String>, aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id,
            group: group.into(),
            root_partition_key: DEFAULT_ROOT_PARTITION_KEY.to_string(),
        }
    }

    pub fn with_root_partition(mut self, root_partition_key: impl Into<String>) -> Self {
        self.root_partition_key = root_partition_key.into();
        self
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn root_partition_key(&self) -> &str {
        &self.root_partition_key
    }

    pub fn stream_key(&self) -> String {
        format!(
            "{}@{}@{}",
            self.root_partition_key, self.group, self.aggregate_id
        )
    }
}

impl core::fmt::Display for PartitionKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}@{}@{}",
            self.root_partition_key, self.group, self.aggregate_id
        )
    }
}

impl FromStr for PartitionKeys {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('@').collect();
        let [root, group, id] = parts.as_slice() else {
            return Err(DomainError::validation(format!(
                "partition keys must look like root@group@id: {s}"
            )));
        };
        if root.is_empty() || group.is_empty() {
            return Err(DomainError::validation(format!(
                "partition keys need a root partition and a group: {s}"
            )));
        }
        Ok(Self::existing(*group, id.parse()?).with_root_partition(*root))
    }
}
