//! `foldwise-core` — ordering, identity and aggregate primitives.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the sortable event id, partition keys, the aggregate fold and the clock
//! abstraction the rest of the workspace is driven by.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;
pub mod partition;
pub mod sortable_id;

pub use aggregate::{Aggregate, AggregatePayload, AggregateProjector, ExpectedVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, EventId};
pub use partition::{DEFAULT_ROOT_PARTITION_KEY, PartitionKeys};
pub use sortable_id::{SortableIdGenerator, SortableUniqueId};
