//! Per-key worker tasks.
//!
//! Each aggregate stream and each multi-projector is owned by one tokio task
//! that processes its inbox sequentially. Handles are cheap to clone; a worker
//! shuts itself down after `worker_idle_timeout` without messages and is
//! respawned on the next request.

use std::any::Any;

pub mod aggregate_worker;
pub mod projection_worker;

pub use aggregate_worker::AggregateHandle;
pub use projection_worker::ProjectionHandle;

/// Type-erased view of a handle, as kept in the engine's registry.
pub(crate) trait WorkerHandle: Any + Send + Sync {
    fn is_alive(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}
