//! Multi-projection state and its fold.
//!
//! Read models are **disposable**; events are the source of truth.
//! This module provides deterministic replay and cursor tracking without
//! making storage assumptions.

use serde::{Deserialize, Serialize};

use foldwise_core::{EventId, SortableUniqueId};

use crate::envelope::EventEnvelope;
use crate::error::ProjectionError;
use crate::projection::MultiProjector;

/// A multi-projection payload plus the cursor of the last folded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiProjectionState<P> {
    payload: P,
    last_event_id: Option<EventId>,
    last_sortable_unique_id: Option<SortableUniqueId>,
    /// Number of events folded (or skipped as poison) so far.
    version: u64,
    /// `version` at which this state was restored from a snapshot (0 = never).
    applied_snapshot_version: u64,
}

impl<P> MultiProjectionState<P> {
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            last_event_id: None,
            last_sortable_unique_id: None,
            version: 0,
            applied_snapshot_version: 0,
        }
    }

    pub fn initial<M>() -> Self
    where
        M: MultiProjector<Payload = P>,
    {
        Self::new(M::initial())
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id
    }

    pub fn last_sortable_unique_id(&self) -> Option<&SortableUniqueId> {
        self.last_sortable_unique_id.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn applied_snapshot_version(&self) -> u64 {
        self.applied_snapshot_version
    }

    /// Record that this state was just restored from a snapshot.
    pub fn mark_snapshot_applied(&mut self) {
        self.applied_snapshot_version = self.version;
    }

    /// Fold one envelope, enforcing strictly increasing global order.
    ///
    /// On error neither the payload nor the cursor moves.
    pub fn apply<M>(&mut self, envelope: &EventEnvelope) -> Result<(), ProjectionError>
    where
        M: MultiProjector<Payload = P>,
    {
        self.ensure_after_cursor(envelope)?;
        M::project(&mut self.payload, envelope)?;
        self.advance(envelope);
        Ok(())
    }

    /// Move the cursor past `envelope` without folding it (poison skip).
    pub fn skip(&mut self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        self.ensure_after_cursor(envelope)?;
        self.advance(envelope);
        Ok(())
    }

    /// Apply many envelopes in order.
    pub fn run<'a, M>(
        &mut self,
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<(), ProjectionError>
    where
        M: MultiProjector<Payload = P>,
    {
        for envelope in envelopes {
            self.apply::<M>(envelope)?;
        }
        Ok(())
    }

    /// Rebuild a projection from scratch by replaying the full event history.
    pub fn rebuild_from_scratch<'a, M>(
        envelopes: impl IntoIterator<Item = &'a EventEnvelope>,
    ) -> Result<Self, ProjectionError>
    where
        M: MultiProjector<Payload = P>,
    {
        let mut state = Self::initial::<M>();
        state.run::<M>(envelopes)?;
        Ok(state)
    }

    fn ensure_after_cursor(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        match &self.last_sortable_unique_id {
            Some(last) if envelope.sortable_unique_id() <= last => {
                Err(ProjectionError::NonMonotonic {
                    last: last.clone(),
                    found: envelope.sortable_unique_id().clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn advance(&mut self, envelope: &EventEnvelope) {
        self.last_event_id = Some(envelope.id());
        self.last_sortable_unique_id = Some(envelope.sortable_unique_id().clone());
        self.version += 1;
    }
}
