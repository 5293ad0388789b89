use rayon::prelude::*;
use serde::Serialize;
use tilescope_rules::{Classification, CompiledRuleSet};
use tilescope_store::{SourceFile, TileStore};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::heatmap::{percentage, HeatmapAssembler, RuleCounts, RulePercentages};

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub total_tiles_evaluated: usize,
    pub rule_match_counts: RuleCounts,
}

impl AggregateReport {
    pub fn rule_match_percentages(&self) -> RulePercentages<'_> {
        self.rule_match_counts.percentages()
    }
}

impl Serialize for AggregateReport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            total_tiles_evaluated: usize,
            rule_match_counts: &'a RuleCounts,
            rule_match_percentages: RulePercentages<'a>,
        }
        Wire {
            total_tiles_evaluated: self.total_tiles_evaluated,
            rule_match_counts: &self.rule_match_counts,
            rule_match_percentages: self.rule_match_percentages(),
        }
        .serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleMatchDetail {
    pub rule_index: Classification,
    pub rule_name: Option<String>,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageReport {
    pub json_filename: String,
    pub total_tiles: usize,
    pub rule_match_details: Vec<RuleMatchDetail>,
}

/// Folds per-file rule counts across the whole store. Files are processed
/// in parallel; only one file's tiles are classified per task.
#[derive(Debug, Clone, Copy)]
pub struct StatsAggregator<'a> {
    store: &'a TileStore,
}

impl<'a> StatsAggregator<'a> {
    pub fn new(store: &'a TileStore) -> Self {
        Self { store }
    }

    pub fn aggregate(
        &self,
        rules: &CompiledRuleSet,
        cancel: &CancellationToken,
    ) -> Result<AggregateReport> {
        let assembler = HeatmapAssembler::new(self.store);
        let rule_match_counts = self
            .store
            .source_files()
            .par_iter()
            .map(|source| {
                checkpoint(cancel)?;
                Ok::<RuleCounts, EngineError>(assembler.count(source.id, rules))
            })
            .try_reduce(
                || RuleCounts::new(rules.len()),
                |acc, counts| Ok(acc.merge(&counts)),
            )?;

        log::info!(
            "Aggregated {} tiles across {} source files",
            rule_match_counts.total(),
            self.store.source_files().len()
        );
        Ok(AggregateReport {
            total_tiles_evaluated: rule_match_counts.total(),
            rule_match_counts,
        })
    }

    /// One entry per source file, ascending filename.
    pub fn per_image_report(
        &self,
        rules: &CompiledRuleSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<ImageReport>> {
        let assembler = HeatmapAssembler::new(self.store);
        let files: Vec<&SourceFile> = self.store.source_files_by_name();
        let reports = files
            .par_iter()
            .map(|source| {
                checkpoint(cancel)?;
                let counts = assembler.count(source.id, rules);
                Ok(image_report(source, &counts, rules))
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!("Built per-image report for {} source files", reports.len());
        Ok(reports)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

fn image_report(source: &SourceFile, counts: &RuleCounts, rules: &CompiledRuleSet) -> ImageReport {
    let total_tiles = counts.total();
    let rule_match_details = counts
        .iter()
        .map(|(classification, count)| RuleMatchDetail {
            rule_index: classification,
            rule_name: match classification {
                Classification::Rule(idx) => rules.rule_name(idx).map(str::to_string),
                Classification::Default => None,
            },
            count,
            percentage: percentage(count, total_tiles),
        })
        .collect();
    ImageReport {
        json_filename: source.json_filename.clone(),
        total_tiles,
        rule_match_details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{store_with, tile};
    use pretty_assertions::assert_eq;
    use tilescope_rules::{Rule, RuleSet};
    use tilescope_store::{Condition, TileDraft};

    fn rules() -> CompiledRuleSet {
        CompiledRuleSet::compile(&RuleSet::new("#000").with_rule(
            Rule::new("#f00", "AND", vec![Condition::new("entropy", ">=", 5.0)]).named("busy"),
        ))
        .unwrap()
    }

    fn entropy_tiles(values: &[f64]) -> Vec<TileDraft> {
        values
            .iter()
            .enumerate()
            .map(|(i, &e)| {
                let mut t = tile(i as u32, 0);
                t.entropy = Some(e);
                t
            })
            .collect()
    }

    fn store() -> TileStore {
        store_with(vec![
            ("zeta.json", entropy_tiles(&[6.0, 1.0])),
            ("alpha.json", entropy_tiles(&[7.0, 7.0, 7.0, 0.5])),
            ("empty.json", Vec::new()),
        ])
    }

    #[test]
    fn aggregate_sums_every_file() {
        let store = store();
        let report = StatsAggregator::new(&store)
            .aggregate(&rules(), &CancellationToken::new())
            .unwrap();
        assert_eq!(report.total_tiles_evaluated, 6);
        assert_eq!(report.rule_match_counts.get(Classification::Rule(0)), 4);
        assert_eq!(report.rule_match_counts.get(Classification::Default), 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["total_tiles_evaluated"], 6);
        assert_eq!(json["rule_match_counts"]["0"], 4);
        let pct = json["rule_match_percentages"]["default"].as_f64().unwrap();
        assert!((pct - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn per_image_report_is_sorted_and_handles_empty_files() {
        let store = store();
        let report = StatsAggregator::new(&store)
            .per_image_report(&rules(), &CancellationToken::new())
            .unwrap();

        let names: Vec<&str> = report.iter().map(|r| r.json_filename.as_str()).collect();
        assert_eq!(names, vec!["alpha.json", "empty.json", "zeta.json"]);

        let alpha = &report[0];
        assert_eq!(alpha.total_tiles, 4);
        assert_eq!(
            alpha.rule_match_details[0],
            RuleMatchDetail {
                rule_index: Classification::Rule(0),
                rule_name: Some("busy".to_string()),
                count: 3,
                percentage: 75.0,
            }
        );
        assert_eq!(alpha.rule_match_details[1].rule_name, None);

        let empty = &report[1];
        assert_eq!(empty.total_tiles, 0);
        assert!(empty
            .rule_match_details
            .iter()
            .all(|d| d.count == 0 && d.percentage == 0.0));

        let json = serde_json::to_value(&report[2]).unwrap();
        assert_eq!(json["rule_match_details"][1]["rule_index"], "default");
    }

    #[test]
    fn empty_store_aggregates_to_zero() {
        let store = TileStore::empty();
        let report = StatsAggregator::new(&store)
            .aggregate(&rules(), &CancellationToken::new())
            .unwrap();
        assert_eq!(report.total_tiles_evaluated, 0);
        assert_eq!(report.rule_match_counts.percentage(Classification::Rule(0)), 0.0);
    }

    #[test]
    fn cancelled_scans_stop() {
        let store = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let aggregator = StatsAggregator::new(&store);
        assert!(matches!(
            aggregator.aggregate(&rules(), &cancel).unwrap_err(),
            EngineError::Cancelled
        ));
        assert!(matches!(
            aggregator.per_image_report(&rules(), &cancel).unwrap_err(),
            EngineError::Cancelled
        ));
    }
}
