use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tilescope_rules::{Classification, CompiledRuleSet};
use tilescope_store::{SourceFile, TileStore};

use crate::error::{EngineError, Result};

/// 4096 x 4096 tiles.
pub const DEFAULT_MAX_GRID_CELLS: u64 = 16_777_216;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    NoTile,
    Assigned(Classification),
}

/// Per-category tile counts in report order: every rule index, then
/// `default`. Categories with no tiles are still present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCounts {
    by_rule: Vec<usize>,
    default: usize,
}

impl RuleCounts {
    pub fn new(rule_count: usize) -> Self {
        Self {
            by_rule: vec![0; rule_count],
            default: 0,
        }
    }

    pub fn record(&mut self, classification: Classification) {
        match classification {
            Classification::Rule(idx) => {
                if let Some(slot) = self.by_rule.get_mut(idx) {
                    *slot += 1;
                }
            }
            Classification::Default => self.default += 1,
        }
    }

    pub fn get(&self, classification: Classification) -> usize {
        match classification {
            Classification::Rule(idx) => self.by_rule.get(idx).copied().unwrap_or(0),
            Classification::Default => self.default,
        }
    }

    pub fn total(&self) -> usize {
        self.by_rule.iter().sum::<usize>() + self.default
    }

    pub fn rule_count(&self) -> usize {
        self.by_rule.len()
    }

    #[must_use]
    pub fn merge(mut self, other: &Self) -> Self {
        for (mine, theirs) in self.by_rule.iter_mut().zip(&other.by_rule) {
            *mine += theirs;
        }
        self.default += other.default;
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (Classification, usize)> + '_ {
        self.by_rule
            .iter()
            .enumerate()
            .map(|(idx, &count)| (Classification::Rule(idx), count))
            .chain(std::iter::once((Classification::Default, self.default)))
    }

    /// `count / total * 100`, zero when nothing was counted.
    pub fn percentage(&self, classification: Classification) -> f64 {
        percentage(self.get(classification), self.total())
    }

    pub fn percentages(&self) -> RulePercentages<'_> {
        RulePercentages(self)
    }
}

pub(crate) fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}

impl Serialize for RuleCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.by_rule.len() + 1))?;
        for (classification, count) in self.iter() {
            map.serialize_entry(&classification, &count)?;
        }
        map.end()
    }
}

/// Serializes as `{"0": 12.5, ..., "default": 87.5}`.
#[derive(Debug, Clone, Copy)]
pub struct RulePercentages<'a>(&'a RuleCounts);

impl Serialize for RulePercentages<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let total = self.0.total();
        let mut map = serializer.serialize_map(Some(self.0.by_rule.len() + 1))?;
        for (classification, count) in self.0.iter() {
            map.serialize_entry(&classification, &percentage(count, total))?;
        }
        map.end()
    }
}

/// Dense row-major grid of one source file's classifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    pub source_file_id: u64,
    pub json_filename: String,
    width: usize,
    height: usize,
    cells: Vec<Cell>,
    counts: RuleCounts,
    no_tile_count: usize,
}

impl Heatmap {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cell(&self, col: usize, row: usize) -> Option<Cell> {
        if col >= self.width || row >= self.height {
            return None;
        }
        self.cells.get(row * self.width + col).copied()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> {
        // chunks(0) panics; an empty grid has no rows.
        self.cells.chunks(self.width.max(1))
    }

    pub fn counts(&self) -> &RuleCounts {
        &self.counts
    }

    pub fn no_tile_count(&self) -> usize {
        self.no_tile_count
    }

    pub fn tile_count(&self) -> usize {
        self.counts.total()
    }

    /// One color per cell, row-major. Holes take the default color.
    pub fn colors<'r>(&self, rules: &'r CompiledRuleSet) -> Vec<&'r str> {
        self.cells
            .iter()
            .map(|cell| match *cell {
                Cell::Assigned(classification) => rules.color(classification),
                Cell::NoTile => rules.default_color(),
            })
            .collect()
    }
}

/// Classifies every tile of a source file into its grid cell.
#[derive(Debug, Clone, Copy)]
pub struct HeatmapAssembler<'a> {
    store: &'a TileStore,
    max_cells: u64,
}

impl<'a> HeatmapAssembler<'a> {
    pub fn new(store: &'a TileStore) -> Self {
        Self {
            store,
            max_cells: DEFAULT_MAX_GRID_CELLS,
        }
    }

    #[must_use]
    pub fn with_max_cells(mut self, max_cells: u64) -> Self {
        self.max_cells = max_cells;
        self
    }

    pub fn assemble_by_name(&self, json_filename: &str, rules: &CompiledRuleSet) -> Result<Heatmap> {
        let source = self
            .store
            .source_by_filename(json_filename)
            .ok_or_else(|| EngineError::SourceFileNotFound(json_filename.to_string()))?;
        self.assemble_source(source, rules)
    }

    pub fn assemble(&self, source_file_id: u64, rules: &CompiledRuleSet) -> Result<Heatmap> {
        let source = self
            .store
            .source_file(source_file_id)
            .ok_or_else(|| EngineError::SourceFileNotFound(format!("id {source_file_id}")))?;
        self.assemble_source(source, rules)
    }

    /// Counts only, without the grid. What the aggregator folds over.
    pub fn count(&self, source_file_id: u64, rules: &CompiledRuleSet) -> RuleCounts {
        let mut counts = RuleCounts::new(rules.len());
        for tile in self.store.source_tiles(source_file_id) {
            counts.record(rules.classify(tile));
        }
        counts
    }

    fn assemble_source(&self, source: &SourceFile, rules: &CompiledRuleSet) -> Result<Heatmap> {
        let tiles: Vec<_> = self.store.source_tiles(source.id).collect();
        let (width, height) = tiles.iter().fold((0u64, 0u64), |(w, h), t| {
            (
                w.max(u64::from(t.record.col) + 1),
                h.max(u64::from(t.record.row) + 1),
            )
        });

        if width.saturating_mul(height) > self.max_cells {
            return Err(EngineError::GridTooLarge {
                json_filename: source.json_filename.clone(),
                width,
                height,
                limit: self.max_cells,
            });
        }
        // Both fit in usize: their product is bounded by max_cells.
        let (width, height) = (width as usize, height as usize);

        let mut cells = vec![Cell::NoTile; width * height];
        let mut counts = RuleCounts::new(rules.len());
        for tile in &tiles {
            let classification = rules.classify(*tile);
            counts.record(classification);
            cells[tile.record.row as usize * width + tile.record.col as usize] =
                Cell::Assigned(classification);
        }
        let no_tile_count = cells.len() - tiles.len();

        log::debug!(
            "heatmap '{}': {width}x{height}, {} tiles, {no_tile_count} holes",
            source.json_filename,
            tiles.len()
        );
        Ok(Heatmap {
            source_file_id: source.id,
            json_filename: source.json_filename.clone(),
            width,
            height,
            cells,
            counts,
            no_tile_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{store_with, tile};
    use pretty_assertions::assert_eq;
    use tilescope_rules::{Rule, RuleSet};
    use tilescope_store::Condition;

    fn sharp_rules() -> CompiledRuleSet {
        CompiledRuleSet::compile(
            &RuleSet::new("#CCCCCC")
                .with_rule(Rule::new(
                    "#ff0000",
                    "AND",
                    vec![Condition::new("sharpness", ">", 100.0)],
                ))
                .with_rule(Rule::new(
                    "#00ff00",
                    "AND",
                    vec![Condition::new("sharpness", ">", 10.0)],
                )),
        )
        .unwrap()
    }

    fn sparse_store() -> TileStore {
        let mut a = tile(0, 0);
        a.sharpness = Some(500.0);
        let mut b = tile(2, 0);
        b.sharpness = Some(50.0);
        let mut c = tile(1, 1);
        c.sharpness = Some(1.0);
        let d = tile(2, 1);
        store_with(vec![("sparse.json", vec![a, b, c, d])])
    }

    #[test]
    fn grid_places_tiles_and_marks_holes() {
        let store = sparse_store();
        let rules = sharp_rules();
        let heatmap = HeatmapAssembler::new(&store)
            .assemble_by_name("sparse.json", &rules)
            .unwrap();

        assert_eq!((heatmap.width(), heatmap.height()), (3, 2));
        assert_eq!(heatmap.cell(0, 0), Some(Cell::Assigned(Classification::Rule(0))));
        assert_eq!(heatmap.cell(1, 0), Some(Cell::NoTile));
        assert_eq!(heatmap.cell(2, 0), Some(Cell::Assigned(Classification::Rule(1))));
        assert_eq!(heatmap.cell(0, 1), Some(Cell::NoTile));
        assert_eq!(heatmap.cell(1, 1), Some(Cell::Assigned(Classification::Default)));
        assert_eq!(heatmap.cell(2, 1), Some(Cell::Assigned(Classification::Default)));
        assert_eq!(heatmap.cell(3, 0), None);
        assert_eq!(heatmap.no_tile_count(), 2);
        assert_eq!(heatmap.rows().count(), 2);

        assert_eq!(
            heatmap.colors(&rules),
            vec!["#ff0000", "#CCCCCC", "#00ff00", "#CCCCCC", "#CCCCCC", "#CCCCCC"]
        );
    }

    #[test]
    fn counts_sum_to_tile_count_and_serialize_in_order() {
        let store = sparse_store();
        let rules = sharp_rules();
        let assembler = HeatmapAssembler::new(&store);
        let heatmap = assembler.assemble(1, &rules).unwrap();

        assert_eq!(heatmap.counts().total(), 4);
        assert_eq!(heatmap.tile_count(), store.source_file(1).unwrap().tile_count);
        assert_eq!(assembler.count(1, &rules), heatmap.counts().clone());
        assert_eq!(
            serde_json::to_string(heatmap.counts()).unwrap(),
            r#"{"0":1,"1":1,"default":2}"#
        );
        assert_eq!(
            serde_json::to_string(&heatmap.counts().percentages()).unwrap(),
            r#"{"0":25.0,"1":25.0,"default":50.0}"#
        );
    }

    #[test]
    fn assembly_is_deterministic() {
        let store = sparse_store();
        let rules = sharp_rules();
        let assembler = HeatmapAssembler::new(&store);
        assert_eq!(
            assembler.assemble(1, &rules).unwrap(),
            assembler.assemble(1, &rules).unwrap()
        );
    }

    #[test]
    fn empty_source_is_a_zero_grid() {
        let store = store_with(vec![("empty.json", Vec::new())]);
        let rules = sharp_rules();
        let heatmap = HeatmapAssembler::new(&store)
            .assemble_by_name("empty.json", &rules)
            .unwrap();
        assert_eq!((heatmap.width(), heatmap.height()), (0, 0));
        assert_eq!(heatmap.no_tile_count(), 0);
        assert_eq!(heatmap.rows().count(), 0);
        assert!(heatmap.counts().iter().all(|(_, count)| count == 0));
        assert_eq!(heatmap.counts().percentage(Classification::Default), 0.0);
    }

    #[test]
    fn unknown_files_and_oversized_grids_fail() {
        let store = store_with(vec![("far.json", vec![tile(0, 0), tile(999, 999)])]);
        let rules = sharp_rules();
        let assembler = HeatmapAssembler::new(&store);

        assert!(matches!(
            assembler.assemble_by_name("missing.json", &rules).unwrap_err(),
            EngineError::SourceFileNotFound(_)
        ));
        assert!(matches!(
            assembler.with_max_cells(10_000).assemble(1, &rules).unwrap_err(),
            EngineError::GridTooLarge { width: 1000, height: 1000, .. }
        ));
    }
}
