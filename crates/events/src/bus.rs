//! Notice publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes [`crate::UpdateNotice`]s (or any other message) to
//! every live subscriber. It makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels today, a broker tomorrow
//! - **At-least-once**: messages may be duplicated; consumers must be idempotent
//! - **No persistence**: the event store is the source of truth, the bus only
//!   shortens the time until a cache notices new events

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::BusError;

/// A subscription to a bus.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Discard everything already queued, returning how many messages were dropped.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

/// Pub/sub abstraction.
///
/// Messages are published only after the corresponding events are durable,
/// so a failed publish never loses data. Implementations must be safe to share
/// across tasks.
pub trait EventBus<M>: Send + Sync {
    fn publish(&self, message: M) -> Result<(), BusError>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    fn publish(&self, message: M) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
