//! Events, envelopes and the fold contracts built on them.
//!
//! - [`DomainEvent`]: typed domain events with a static tag registry
//! - [`EventEnvelope`]: a committed event as stored and distributed
//! - [`Command`] / [`handler`]: pure command decisions and aggregate replay
//! - [`MultiProjector`] / [`MultiProjectionState`]: cross-stream read models
//! - [`MultiProjectionQuery`] / [`MultiProjectionListQuery`]: pure query handlers
//! - [`EventBus`]: update-notice distribution

pub mod bus;
pub mod command;
pub mod envelope;
pub mod error;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod notice;
pub mod projection;
pub mod query;
pub mod runner;
pub mod selector;

pub use bus::{EventBus, Subscription};
pub use command::{Command, EventOf, PayloadOf};
pub use envelope::{EventEnvelope, EventMetadata};
pub use error::{BusError, EventDecodeError, ProjectionError};
pub use event::DomainEvent;
pub use handler::{ReplayError, decide, fold_envelope, replay};
pub use in_memory_bus::InMemoryEventBus;
pub use notice::UpdateNotice;
pub use projection::MultiProjector;
pub use query::{MultiProjectionListQuery, MultiProjectionQuery, ProjectedPayload, QueryContext};
pub use runner::MultiProjectionState;
pub use selector::EventSelector;
