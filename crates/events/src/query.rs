//! Query contracts over multi-projections.
//!
//! Handlers are pure: they read a [`MultiProjectionState`] and never touch the
//! store. Waiting, paging and warnings are the engine's job.

use foldwise_core::{DomainResult, SortableUniqueId};

use crate::projection::MultiProjector;
use crate::runner::MultiProjectionState;

/// Payload type of a query's projector.
pub type ProjectedPayload<M> = <M as MultiProjector>::Payload;

/// What the handler is looking at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub projector: &'static str,
    /// Events folded into the safe (settled) state.
    pub safe_version: u64,
    /// Events folded on top of it from inside the safe window.
    pub unsafe_version: u64,
    pub safe_sortable_unique_id: Option<SortableUniqueId>,
    /// Newest event reflected in the state handed to the handler.
    pub last_sortable_unique_id: Option<SortableUniqueId>,
}

/// A query that produces one value from a projection.
pub trait MultiProjectionQuery: Send + Sync + 'static {
    type Projector: MultiProjector;
    type Output: Send + 'static;

    fn handle_query(
        &self,
        state: &MultiProjectionState<ProjectedPayload<Self::Projector>>,
        context: &QueryContext,
    ) -> DomainResult<Self::Output>;
}

/// A query that filters then sorts a projection into a pageable list.
///
/// `handle_sort` must impose a total order; pages are cut from its output.
pub trait MultiProjectionListQuery: Send + Sync + 'static {
    type Projector: MultiProjector;
    type Item: Send + 'static;

    fn handle_filter(
        &self,
        state: &MultiProjectionState<ProjectedPayload<Self::Projector>>,
        context: &QueryContext,
    ) -> DomainResult<Vec<Self::Item>>;

    fn handle_sort(
        &self,
        items: Vec<Self::Item>,
        context: &QueryContext,
    ) -> DomainResult<Vec<Self::Item>>;
}
