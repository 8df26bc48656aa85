//! Cart summaries: a read model across every cart stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use foldwise_core::{AggregateId, DomainResult};
use foldwise_events::{
    EventEnvelope, EventSelector, MultiProjectionListQuery, MultiProjectionQuery,
    MultiProjectionState, MultiProjector, ProjectionError, QueryContext,
};

use crate::cart::{CART_GROUP, CartEvent};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartStatus {
    Active,
    CheckedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSummary {
    pub cart_id: AggregateId,
    pub root_partition_key: String,
    pub owner: String,
    pub item_count: u32,
    pub total_cents: i64,
    pub status: CartStatus,
}

/// Live (not deleted) carts by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSummaries {
    pub carts: BTreeMap<AggregateId, CartSummary>,
}

pub struct CartSummaryProjector;

impl CartSummaryProjector {
    fn unknown_cart(envelope: &EventEnvelope) -> ProjectionError {
        ProjectionError::Rejected {
            event_type: envelope.event_type().to_string(),
            reason: format!(
                "cart {} has no summary",
                envelope.partition_keys().aggregate_id()
            ),
        }
    }
}

impl MultiProjector for CartSummaryProjector {
    type Payload = CartSummaries;
    const NAME: &'static str = "cart_summary";

    fn selector() -> EventSelector {
        EventSelector::groups([CART_GROUP])
    }

    fn initial() -> CartSummaries {
        CartSummaries::default()
    }

    fn project(payload: &mut CartSummaries, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let Some(event) = envelope.decode::<CartEvent>()? else {
            return Ok(());
        };
        let keys = envelope.partition_keys();
        let cart_id = keys.aggregate_id();

        match event {
            CartEvent::CartCreated { owner } => {
                payload.carts.insert(
                    cart_id,
                    CartSummary {
                        cart_id,
                        root_partition_key: keys.root_partition_key().to_string(),
                        owner,
                        item_count: 0,
                        total_cents: 0,
                        status: CartStatus::Active,
                    },
                );
            }
            CartEvent::ItemAdded {
                quantity,
                unit_price_cents,
                ..
            } => {
                let summary = payload
                    .carts
                    .get_mut(&cart_id)
                    .ok_or_else(|| Self::unknown_cart(envelope))?;
                let item_count = summary.item_count.checked_add(quantity);
                let total_cents = i64::from(quantity)
                    .checked_mul(unit_price_cents)
                    .and_then(|line| summary.total_cents.checked_add(line));
                let (Some(item_count), Some(total_cents)) = (item_count, total_cents) else {
                    return Err(ProjectionError::Rejected {
                        event_type: envelope.event_type().to_string(),
                        reason: format!("totals of cart {cart_id} overflow"),
                    });
                };
                summary.item_count = item_count;
                summary.total_cents = total_cents;
            }
            CartEvent::CartCheckedOut { total_cents } => {
                let summary = payload
                    .carts
                    .get_mut(&cart_id)
                    .ok_or_else(|| Self::unknown_cart(envelope))?;
                summary.status = CartStatus::CheckedOut;
                summary.total_cents = total_cents;
            }
            CartEvent::CartDeleted => {
                payload.carts.remove(&cart_id);
            }
        }
        Ok(())
    }
}

/// Carts filtered by owner and status, ordered by owner then id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartListQuery {
    pub owner: Option<String>,
    pub status: Option<CartStatus>,
}

impl MultiProjectionListQuery for CartListQuery {
    type Projector = CartSummaryProjector;
    type Item = CartSummary;

    fn handle_filter(
        &self,
        state: &MultiProjectionState<CartSummaries>,
        _context: &QueryContext,
    ) -> DomainResult<Vec<CartSummary>> {
        Ok(state
            .payload()
            .carts
            .values()
            .filter(|c| self.owner.as_ref().is_none_or(|o| &c.owner == o))
            .filter(|c| self.status.is_none_or(|s| c.status == s))
            .cloned()
            .collect())
    }

    fn handle_sort(
        &self,
        mut items: Vec<CartSummary>,
        _context: &QueryContext,
    ) -> DomainResult<Vec<CartSummary>> {
        items.sort_by(|a, b| a.owner.cmp(&b.owner).then(a.cart_id.cmp(&b.cart_id)));
        Ok(items)
    }
}

/// Number of live carts, optionally by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CartCountQuery {
    pub status: Option<CartStatus>,
}

impl MultiProjectionQuery for CartCountQuery {
    type Projector = CartSummaryProjector;
    type Output = usize;

    fn handle_query(
        &self,
        state: &MultiProjectionState<CartSummaries>,
        _context: &QueryContext,
    ) -> DomainResult<usize> {
        Ok(state
            .payload()
            .carts
            .values()
            .filter(|c| self.status.is_none_or(|s| c.status == s))
            .count())
    }
}
