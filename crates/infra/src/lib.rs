//! Infrastructure layer: stores, workers and the engine that wires them.
//!
//! - [`event_store`]: append-only partitioned event storage
//! - [`command_executor`]: load, decide, append with optimistic concurrency
//! - [`multi_projection`]: safe/unsafe materialized views with snapshots
//! - [`query`]: query results, paging and wait-for-event options
//! - [`workers`]: per-stream and per-projector actors
//! - [`engine`]: the public entry point

pub mod blob_store;
pub mod command_executor;
pub mod config;
pub mod engine;
pub mod event_store;
pub mod multi_projection;
pub mod query;
pub mod snapshot;
pub mod workers;


pub use blob_store::{BlobKey, BlobStore, BlobStoreError, InMemoryBlobStore};
pub use command_executor::{CommandError, CommandExecutor, CommandResponse};
pub use config::{ConfigError, EngineConfig, FoldFailurePolicy};
pub use engine::{Engine, EngineBuilder};
pub use event_store::{
    EventStore, EventStoreError, EventStream, InMemoryEventStore, NotifyingEventStore,
    UncommittedEvent,
};
pub use multi_projection::{FoldFailure, MultiProjectionEngine, ProjectionRefreshError, ProjectionView};
pub use query::{ListQueryResult, PageRequest, QueryError, QueryOptions, QueryResult};
pub use snapshot::{InMemorySnapshotStore, SnapshotEnvelope, SnapshotError, SnapshotStore};
pub use workers::{AggregateHandle, ProjectionHandle};
