//! Request and response bodies shared by the HTTP server and the CLI.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tilescope_engine::{Heatmap, QueryPage, RuleCounts, SortSpec};
use tilescope_rules::{CompiledRuleSet, RuleSet};
use tilescope_store::{Condition, TileRef};

#[derive(Debug, Serialize)]
pub(crate) struct TilesResponse<'a> {
    pub results: Vec<TileRef<'a>>,
    pub total_results: usize,
    pub page: u64,
    pub limit: u64,
}

impl<'a> From<QueryPage<'a>> for TilesResponse<'a> {
    fn from(page: QueryPage<'a>) -> Self {
        Self {
            results: page.records,
            total_results: page.total_match_count,
            page: page.page,
            limit: page.page_size,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HeatmapRequest {
    pub json_filename: String,
    pub rules_config: RuleSet,
}

#[derive(Debug, Serialize)]
pub(crate) struct HeatmapResponse<'a> {
    pub heatmap_data: Vec<&'a str>,
    pub grid_width: usize,
    pub grid_height: usize,
    pub rules_config: &'a RuleSet,
    pub rule_match_counts: &'a RuleCounts,
    pub no_tile_count: usize,
}

impl<'a> HeatmapResponse<'a> {
    pub fn new(heatmap: &'a Heatmap, rules: &'a CompiledRuleSet) -> Self {
        Self {
            heatmap_data: heatmap.colors(rules),
            grid_width: heatmap.width(),
            grid_height: heatmap.height(),
            rules_config: rules.rule_set(),
            rule_match_counts: heatmap.counts(),
            no_tile_count: heatmap.no_tile_count(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SaveRulesRequest {
    pub rule_name: String,
    pub rules_config: RuleSet,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ExportRequest {
    #[serde(default)]
    pub filters: Vec<Condition>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
}

pub(crate) fn export_filename(date: NaiveDate) -> String {
    format!("tile_export_{}.csv", date.format("%Y%m%d"))
}
