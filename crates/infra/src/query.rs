//! Query execution over materialized projection views.
//!
//! The engine resolves a fresh enough [`ProjectionView`] (waiting for a
//! sortable id if asked to), then hands its state to the pure handlers
//! declared in `foldwise_events::query`. Paging happens here, after the
//! handler's sort.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use foldwise_core::{DomainError, SortableUniqueId};
use foldwise_events::{MultiProjectionListQuery, MultiProjectionQuery, ProjectedPayload, QueryContext};

use crate::multi_projection::{ProjectionRefreshError, ProjectionView};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid paging: {0}")]
    InvalidPaging(String),

    /// The handler refused the query parameters.
    #[error("query rejected: {0}")]
    Rejected(DomainError),

    #[error(transparent)]
    Projection(#[from] ProjectionRefreshError),
}

/// 1-based page selection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_number: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Read-your-writes: do not answer from a view older than this id.
    pub wait_for_sortable_unique_id: Option<SortableUniqueId>,
    pub page: Option<PageRequest>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_for(mut self, id: SortableUniqueId) -> Self {
        self.wait_for_sortable_unique_id = Some(id);
        self
    }

    pub fn page(mut self, page_number: usize, page_size: usize) -> Self {
        self.page = Some(PageRequest {
            page_number,
            page_size,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult<T> {
    pub value: T,
    pub context: QueryContext,
    /// Degradations the answer is subject to (halted fold, wait timeout...).
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQueryResult<T> {
    pub total_count: usize,
    /// `None` when the query was not paged.
    pub total_pages: Option<usize>,
    pub current_page: Option<usize>,
    pub page_size: Option<usize>,
    pub items: Vec<T>,
    pub context: QueryContext,
    pub warnings: Vec<String>,
}

impl<T> ListQueryResult<T> {
    /// Cut one page out of fully sorted `items`.
    ///
    /// A page number outside `1..=total_pages` yields no items; the counts
    /// are still reported.
    pub fn paginate(
        items: Vec<T>,
        page: Option<PageRequest>,
        context: QueryContext,
        warnings: Vec<String>,
    ) -> Result<Self, QueryError> {
        let total_count = items.len();
        let Some(PageRequest {
            page_number,
            page_size,
        }) = page
        else {
            return Ok(Self {
                total_count,
                total_pages: None,
                current_page: None,
                page_size: None,
                items,
                context,
                warnings,
            });
        };

        check_page(page)?;

        let total_pages = total_count.div_ceil(page_size);
        let items = if (1..=total_pages).contains(&page_number) {
            items
                .into_iter()
                .skip((page_number - 1) * page_size)
                .take(page_size)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            total_count,
            total_pages: Some(total_pages),
            current_page: Some(page_number),
            page_size: Some(page_size),
            items,
            context,
            warnings,
        })
    }
}

pub(crate) fn check_page(page: Option<PageRequest>) -> Result<(), QueryError> {
    match page {
        Some(PageRequest { page_size: 0, .. }) => Err(QueryError::InvalidPaging(
            "page_size must be positive".to_string(),
        )),
        _ => Ok(()),
    }
}

fn merged_warnings<P>(view: &ProjectionView<P>, extra: Vec<String>) -> Vec<String> {
    view.warnings().iter().cloned().chain(extra).collect()
}

pub(crate) fn run_query<Q: MultiProjectionQuery>(
    query: &Q,
    view: &ProjectionView<ProjectedPayload<Q::Projector>>,
    extra_warnings: Vec<String>,
) -> Result<QueryResult<Q::Output>, QueryError> {
    let context = view.context();
    let value = query
        .handle_query(view.state(), &context)
        .map_err(QueryError::Rejected)?;
    Ok(QueryResult {
        value,
        context,
        warnings: merged_warnings(view, extra_warnings),
    })
}

pub(crate) fn run_list_query<Q: MultiProjectionListQuery>(
    query: &Q,
    view: &ProjectionView<ProjectedPayload<Q::Projector>>,
    page: Option<PageRequest>,
    extra_warnings: Vec<String>,
) -> Result<ListQueryResult<Q::Item>, QueryError> {
    let context = view.context();
    let filtered = query
        .handle_filter(view.state(), &context)
        .map_err(QueryError::Rejected)?;
    let sorted = query
        .handle_sort(filtered, &context)
        .map_err(QueryError::Rejected)?;
    ListQueryResult::paginate(sorted, page, context, merged_warnings(view, extra_warnings))
}
