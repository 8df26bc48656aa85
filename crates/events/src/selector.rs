use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use foldwise_core::PartitionKeys;

use crate::notice::UpdateNotice;

/// Which streams a multi-projection reads: by group and by root partition.
///
/// An empty set means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSelector {
    groups: BTreeSet<String>,
    root_partitions: BTreeSet<String>,
}

impl EventSelector {
    /// Every stream.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            root_partitions: BTreeSet::new(),
        }
    }

    pub fn with_root_partitions<I, S>(mut self, root_partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.root_partitions = root_partitions.into_iter().map(Into::into).collect();
        self
    }

    pub fn group_set(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn root_partition_set(&self) -> &BTreeSet<String> {
        &self.root_partitions
    }

    pub fn matches_parts(&self, group: &str, root_partition_key: &str) -> bool {
        (self.groups.is_empty() || self.groups.contains(group))
            && (self.root_partitions.is_empty() || self.root_partitions.contains(root_partition_key))
    }

    pub fn matches(&self, keys: &PartitionKeys) -> bool {
        self.matches_parts(keys.group(), keys.root_partition_key())
    }

    pub fn matches_notice(&self, notice: &UpdateNotice) -> bool {
        self.matches_parts(&notice.group, &notice.root_partition_key)
    }
}
