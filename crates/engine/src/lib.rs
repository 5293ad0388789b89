//! # Tilescope Engine
//!
//! Read-only analysis over a frozen [`TileStore`](tilescope_store::TileStore):
//!
//! - [`QueryEngine`]: filter, multi-key sort and 1-based pagination
//! - [`HeatmapAssembler`]: dense per-file grid of rule classifications
//! - [`StatsAggregator`]: global and per-file rule match breakdowns,
//!   parallel across source files
//! - [`ExportService`]: capped CSV export in query order
//! - [`distribution`] / [`summary`]: metric statistics
//!
//! Every entry point borrows the store; nothing here mutates it. Long scans
//! take a [`CancellationToken`] and stop with [`EngineError::Cancelled`]
//! once it fires.

mod aggregate;
mod distribution;
mod error;
mod export;
mod heatmap;
mod query;

#[cfg(test)]
mod test_support;

pub use aggregate::{AggregateReport, ImageReport, RuleMatchDetail, StatsAggregator};
pub use distribution::{distribution, summary, Distribution, Summary};
pub use error::{EngineError, Result};
pub use export::{escape_csv, write_csv, ExportService, DEFAULT_EXPORT_LIMIT};
pub use heatmap::{
    Cell, Heatmap, HeatmapAssembler, RuleCounts, RulePercentages, DEFAULT_MAX_GRID_CELLS,
};
pub use query::{
    CompiledQuery, QueryEngine, QueryPage, QueryRequest, SortOrder, SortSpec, DEFAULT_PAGE_SIZE,
};
pub use tokio_util::sync::CancellationToken;
