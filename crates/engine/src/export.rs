use std::borrow::Cow;
use std::io::Write;
use tilescope_store::{Condition, TileField, TileRef, TileStore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::query::{QueryEngine, SortSpec};

pub const DEFAULT_EXPORT_LIMIT: usize = 50_000;

/// Rows written between cancellation checks.
const CANCEL_CHECK_ROWS: usize = 1024;

/// Filtered, sorted tile sets as CSV. The row cap is checked against the
/// full match count before any row is produced.
#[derive(Debug, Clone, Copy)]
pub struct ExportService<'a> {
    engine: QueryEngine<'a>,
    limit: usize,
}

impl<'a> ExportService<'a> {
    pub fn new(store: &'a TileStore) -> Self {
        Self {
            engine: QueryEngine::new(store),
            limit: DEFAULT_EXPORT_LIMIT,
        }
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Rows in the order `QueryEngine::query` would paginate them.
    pub fn export(&self, filters: &[Condition], sort: &[SortSpec]) -> Result<Vec<TileRef<'a>>> {
        let total = self.engine.count(filters)?;
        if total > self.limit {
            log::warn!("Export refused: {total} records exceed limit {}", self.limit);
            return Err(EngineError::ExportTooLarge {
                total,
                limit: self.limit,
            });
        }
        self.engine.select(filters, sort)
    }

    pub fn export_csv(
        &self,
        filters: &[Condition],
        sort: &[SortSpec],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let rows = self.export(filters, sort)?;
        let mut out = Vec::with_capacity(rows.len() * 128);
        write_csv(&rows, &mut out, cancel)?;
        log::info!("Exported {} records ({} bytes)", rows.len(), out.len());
        Ok(out)
    }
}

/// Header is every `TileField` in declaration order; nulls are empty fields.
pub fn write_csv<W: Write>(rows: &[TileRef<'_>], mut out: W, cancel: &CancellationToken) -> Result<()> {
    let header: Vec<&str> = TileField::ALL.iter().map(|f| f.as_str()).collect();
    writeln!(out, "{}", header.join(","))?;

    for (idx, tile) in rows.iter().enumerate() {
        if idx % CANCEL_CHECK_ROWS == 0 && cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let line: Vec<String> = TileField::ALL
            .iter()
            .map(|field| {
                tile.get(*field)
                    .render()
                    .map(|value| escape_csv(&value).into_owned())
                    .unwrap_or_default()
            })
            .collect();
        writeln!(out, "{}", line.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// RFC 4180 quoting: values containing a comma, quote or line break are
/// wrapped in quotes with inner quotes doubled.
pub fn escape_csv(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}
