//! # Tilescope Store
//!
//! Immutable per-tile metric records, grouped by the source file they were
//! ingested from.
//!
//! ## Architecture
//!
//! ```text
//! producer JSON
//!     │
//!     ├──> ingest (parse, skip uncoordinated tiles)
//!     │      └─> SourceBatch
//!     │
//!     ├──> StoreBuilder (assign ids, reject duplicate cells,
//!     │                  attach classifier predictions)
//!     │      └─> TileStore (frozen, indexed by file and (col,row))
//!     │
//!     └──> JSON snapshot on disk
//! ```
//!
//! Every queryable key is a [`TileField`]; conditions are compiled against
//! that closed set before any record is touched.
//!
//! ## Example
//!
//! ```no_run
//! use tilescope_store::{read_source_file, StoreBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut builder = StoreBuilder::new();
//!     builder.add_source(read_source_file("slide-01.json").await?)?;
//!     let store = builder.build()?;
//!     store.save("store.json").await?;
//!     Ok(())
//! }
//! ```

mod condition;
mod error;
mod field;
mod ingest;
mod predictions;
mod store;
mod types;

pub use condition::{CompareOp, CompiledCondition, Condition, ConditionValue};
pub use error::{ConditionError, Result, StoreError};
pub use field::{FieldKind, FieldValue, TileField};
pub use ingest::{discover_json_files, parse_producer_json, read_source_file, SourceBatch, TileDraft};
pub use predictions::{
    parse_prediction_csv, read_prediction_file, Prediction, PredictionBatch, PredictionOutcome,
};
pub use store::{StoreBuilder, TileStore, SNAPSHOT_SCHEMA_VERSION};
pub use types::{SourceFile, TileRecord, TileRef};
