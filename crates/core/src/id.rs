//! Uuid-backed identifiers for aggregates and events.
//!
//! Both are UUIDv7, so ids minted by one process roughly follow creation
//! order. Global event order is carried by [`crate::SortableUniqueId`], never
//! by these.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    DomainError::invalid_id(format!("{} {s:?}: {e}", stringify!($name)))
                })
            }
        }
    };
}

uuid_id! {
    /// The entity part of [`crate::PartitionKeys`].
    AggregateId
}

uuid_id! {
    /// Identity of one committed event, independent of its position.
    EventId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_parses_its_display_form() {
        let id = AggregateId::new();
        let parsed: AggregateId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn malformed_event_id_is_an_invalid_id_format() {
        let err = "not-a-uuid".parse::<EventId>().unwrap_err();
        match err {
            DomainError::InvalidIdFormat(msg) => assert!(msg.starts_with("EventId")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
