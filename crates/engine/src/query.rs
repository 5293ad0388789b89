use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tilescope_store::{
    CompiledCondition, Condition, FieldValue, SourceFile, TileField, TileRef, TileStore,
};

use crate::error::{EngineError, Result};

pub const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Anything other than `desc` (any case) sorts ascending.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub key: String,
    #[serde(default = "default_order")]
    pub order: String,
}

impl SortSpec {
    pub fn new(key: impl Into<String>, order: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            order: order.into(),
        }
    }
}

fn default_order() -> String {
    "asc".to_string()
}

fn default_sort() -> Vec<SortSpec> {
    vec![SortSpec::new("id", "asc")]
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    DEFAULT_PAGE_SIZE
}

/// Body of `POST /tiles` and the CLI `query` command. Page and limit are
/// signed so that out-of-range values surface as `InvalidPagination`
/// instead of a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: Vec<Condition>,
    #[serde(default = "default_sort")]
    pub sort: Vec<SortSpec>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sort: default_sort(),
            page: default_page(),
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryPage<'a> {
    pub records: Vec<TileRef<'a>>,
    pub total_match_count: usize,
    pub page: u64,
    pub page_size: u64,
}

/// Filters and sort keys resolved against the closed field set.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    filters: Vec<CompiledCondition>,
    sort: Vec<(TileField, SortOrder)>,
}

impl CompiledQuery {
    pub fn compile(filters: &[Condition], sort: &[SortSpec]) -> Result<Self> {
        let filters = filters
            .iter()
            .map(|f| CompiledCondition::compile(f).map_err(EngineError::from))
            .collect::<Result<Vec<_>>>()?;
        let sort = sort
            .iter()
            .map(|spec| {
                TileField::parse(&spec.key)
                    .map(|field| (field, SortOrder::parse(&spec.order)))
                    .ok_or_else(|| EngineError::InvalidFilterKey(spec.key.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { filters, sort })
    }

    pub fn matches(&self, tile: TileRef<'_>) -> bool {
        self.filters.iter().all(|f| f.matches(tile))
    }

    /// Sort keys in order, then ascending id.
    pub fn compare(&self, a: TileRef<'_>, b: TileRef<'_>) -> Ordering {
        for &(field, order) in &self.sort {
            let ord = compare_values(a.get(field), b.get(field));
            let ord = match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id().cmp(&b.id())
    }
}

/// Null sorts below every value, so ascending puts nulls first and
/// descending puts them last.
fn compare_values(a: FieldValue<'_>, b: FieldValue<'_>) -> Ordering {
    match (a, b) {
        (FieldValue::Null, FieldValue::Null) => Ordering::Equal,
        (FieldValue::Null, _) => Ordering::Less,
        (_, FieldValue::Null) => Ordering::Greater,
        (FieldValue::Integer(x), FieldValue::Integer(y)) => x.cmp(&y),
        (FieldValue::Text(x), FieldValue::Text(y)) => x.cmp(y),
        (x, y) => match (x.as_number(), y.as_number()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => Ordering::Equal,
        },
    }
}

fn validate_pagination(page: i64, limit: i64) -> Result<(u64, u64)> {
    if page < 1 {
        return Err(EngineError::InvalidPagination(format!(
            "page must be >= 1, got {page}"
        )));
    }
    if limit < 1 {
        return Err(EngineError::InvalidPagination(format!(
            "limit must be > 0, got {limit}"
        )));
    }
    Ok((page as u64, limit as u64))
}

/// Read-only filter/sort/paginate over a store snapshot.
#[derive(Debug, Clone, Copy)]
pub struct QueryEngine<'a> {
    store: &'a TileStore,
}

impl<'a> QueryEngine<'a> {
    pub fn new(store: &'a TileStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &'a TileStore {
        self.store
    }

    /// One page of matches. Pages past the end are empty but still report
    /// the full match count.
    pub fn query(&self, request: &QueryRequest) -> Result<QueryPage<'a>> {
        let (page, page_size) = validate_pagination(request.page, request.limit)?;
        let compiled = CompiledQuery::compile(&request.filters, &request.sort)?;
        let matches = self.sorted_matches(&compiled);
        let total_match_count = matches.len();

        let offset = (page - 1).saturating_mul(page_size);
        let records = usize::try_from(offset)
            .ok()
            .filter(|&offset| offset < total_match_count)
            .map(|offset| {
                let end = usize::try_from(page_size)
                    .map_or(total_match_count, |size| offset.saturating_add(size))
                    .min(total_match_count);
                matches[offset..end].to_vec()
            })
            .unwrap_or_default();

        log::debug!(
            "query: {} filters, {} matches, page {page} returned {} records",
            request.filters.len(),
            total_match_count,
            records.len()
        );
        Ok(QueryPage {
            records,
            total_match_count,
            page,
            page_size,
        })
    }

    pub fn count(&self, filters: &[Condition]) -> Result<usize> {
        let compiled = CompiledQuery::compile(filters, &[])?;
        Ok(self.store.tiles().filter(|t| compiled.matches(*t)).count())
    }

    /// Every match in the order `query` would paginate it.
    pub fn select(&self, filters: &[Condition], sort: &[SortSpec]) -> Result<Vec<TileRef<'a>>> {
        let compiled = CompiledQuery::compile(filters, sort)?;
        Ok(self.sorted_matches(&compiled))
    }

    pub fn source_file(&self, json_filename: &str) -> Result<&'a SourceFile> {
        self.store
            .source_by_filename(json_filename)
            .ok_or_else(|| EngineError::SourceFileNotFound(json_filename.to_string()))
    }

    /// All tiles of one source file, ascending id.
    pub fn source_tiles(&self, source_file_id: u64) -> Result<Vec<TileRef<'a>>> {
        if self.store.source_file(source_file_id).is_none() {
            return Err(EngineError::SourceFileNotFound(format!(
                "id {source_file_id}"
            )));
        }
        Ok(self.store.source_tiles(source_file_id).collect())
    }

    pub fn tile_at(&self, json_filename: &str, col: u32, row: u32) -> Result<TileRef<'a>> {
        let source = self.source_file(json_filename)?;
        self.store
            .tile_at(source.id, col, row)
            .ok_or_else(|| EngineError::TileNotFoundAtCoordinates {
                json_filename: json_filename.to_string(),
                col,
                row,
            })
    }

    fn sorted_matches(&self, compiled: &CompiledQuery) -> Vec<TileRef<'a>> {
        let mut matches: Vec<TileRef<'a>> = self
            .store
            .tiles()
            .filter(|t| compiled.matches(*t))
            .collect();
        matches.sort_by(|a, b| compiled.compare(*a, *b));
        matches
    }
}
