use polyquery_common::config::PaginationConfig;
use polyquery_common::{DbError, DbResult, SortDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::executor::CachedExecutor;
use crate::query::{Operation, OrderBy, QueryBuilder, Row};

/// One page request: page number, size, exact-match filters, free-text
/// search and sort keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    #[serde(default)]
    pub page: u64,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub filters: Row,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub search_fields: Vec<String>,
    #[serde(default)]
    pub sort: Vec<OrderBy>,
}

impl PageRequest {
    pub fn new(page: u64, limit: u64) -> Self {
        Self {
            page,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn search<I, S>(mut self, term: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search = Some(term.into());
        self.search_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: impl Into<SortDirection>) -> Self {
        self.sort.push(OrderBy {
            field: field.into(),
            direction: direction.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub current_page: u64,
    pub total_pages: u64,
    pub total_records: u64,
    pub per_page: u64,
    pub has_next_page: bool,
    pub has_prev_page: bool,
    pub next_page: Option<u64>,
    pub prev_page: Option<u64>,
}

impl PaginationMeta {
    /// `per_page` must be non-zero.
    pub fn compute(current_page: u64, per_page: u64, total_records: u64) -> Self {
        let total_pages = total_records.div_ceil(per_page.max(1));
        let has_next_page = current_page < total_pages;
        let has_prev_page = current_page > 1;
        Self {
            current_page,
            total_pages,
            total_records,
            per_page,
            has_next_page,
            has_prev_page,
            next_page: has_next_page.then(|| current_page + 1),
            prev_page: has_prev_page.then(|| current_page - 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult {
    pub data: Vec<Row>,
    pub filters: Row,
    pub search: Option<String>,
    pub sort: Vec<OrderBy>,
    pub pagination: PaginationMeta,
}

pub struct Paginator {
    executor: Arc<CachedExecutor>,
    config: PaginationConfig,
}

impl Paginator {
    pub fn new(executor: Arc<CachedExecutor>, config: PaginationConfig) -> Self {
        Self { executor, config }
    }

    fn effective_limit(&self, requested: Option<u64>) -> DbResult<u64> {
        let max = self.config.max_limit.max(1);
        match requested {
            Some(0) => Err(DbError::validation_for("limit must be at least 1", "paginate", None)),
            Some(n) => Ok(n.min(max)),
            None => Ok(self.config.default_limit.clamp(1, max)),
        }
    }

    /// Count and fetch one page of `base`.
    ///
    /// The count and data queries share the same predicates: whatever `base`
    /// carries plus the request's filters and search group.
    pub async fn paginate(&self, base: &QueryBuilder, request: &PageRequest) -> DbResult<PaginatedResult> {
        let target = base.descriptor().target.as_deref();
        if base.descriptor().operation != Operation::Select {
            return Err(DbError::validation_for("paginate requires a select query", "paginate", target));
        }
        let page = request.page.max(1);
        let limit = self.effective_limit(request.limit)?;
        let offset = (page - 1).checked_mul(limit).ok_or_else(|| {
            DbError::validation_for(format!("page {} is out of range", page), "paginate", target)
        })?;

        let mut filtered = base.clone();
        for (field, value) in &request.filters {
            filtered = filtered.where_(field.clone(), value.clone());
        }
        if let Some(term) = &request.search {
            filtered = filtered.search(request.search_fields.clone(), term);
        }

        let count_query = filtered.clone().count();
        let mut data_query = filtered;
        for order in &request.sort {
            data_query = data_query.order_by(order.field.clone(), order.direction);
        }
        let data_query = data_query.limit(limit).offset(offset);

        let total = self.executor.run(&count_query).await?.count().unwrap_or(0);
        let data = self.executor.run(&data_query).await?.rows;

        let pagination = PaginationMeta::compute(page, limit, total);
        tracing::debug!(
            "Paginated {:?}: page {}/{} ({} records)",
            target,
            page,
            pagination.total_pages,
            total
        );

        Ok(PaginatedResult {
            data,
            filters: request.filters.clone(),
            search: request.search.clone(),
            sort: request.sort.clone(),
            pagination,
        })
    }
}
