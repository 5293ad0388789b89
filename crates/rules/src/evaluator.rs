use serde::{Serialize, Serializer};
use std::fmt;
use tilescope_store::{CompiledCondition, ConditionError, TileRef};

use crate::error::{Result, RuleError};
use crate::model::RuleSet;

/// Outcome of classifying one tile: the index of the first matching rule,
/// or the default category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Classification {
    Rule(usize),
    Default,
}

impl Classification {
    /// Wire key used in count maps: `"0"`, `"1"`, ... or `"default"`.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Rule(idx) => idx.to_string(),
            Self::Default => "default".to_string(),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(idx) => write!(f, "{idx}"),
            Self::Default => f.write_str("default"),
        }
    }
}

impl Serialize for Classification {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("and") {
            Some(Self::And)
        } else if raw.eq_ignore_ascii_case("or") {
            Some(Self::Or)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: Option<String>,
    color: String,
    logical_op: LogicalOp,
    conditions: Vec<CompiledCondition>,
}

impl CompiledRule {
    fn matches(&self, tile: TileRef<'_>) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.logical_op {
            LogicalOp::And => self.conditions.iter().all(|c| c.matches(tile)),
            LogicalOp::Or => self.conditions.iter().any(|c| c.matches(tile)),
        }
    }
}

/// A validated rule set. Holds no mutable state, so one instance can
/// classify tiles from many threads at once.
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    source: RuleSet,
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    /// Validate every rule up front; no tile is evaluated against a rule
    /// set that failed here.
    pub fn compile(rule_set: &RuleSet) -> Result<Self> {
        let mut rules = Vec::with_capacity(rule_set.rules.len());
        for (rule_index, rule) in rule_set.rules.iter().enumerate() {
            let group = &rule.rule_group;
            let logical_op =
                LogicalOp::parse(&group.logical_op).ok_or_else(|| RuleError::InvalidLogicalOp {
                    rule_index,
                    op: group.logical_op.clone(),
                })?;
            let conditions = group
                .conditions
                .iter()
                .map(|condition| {
                    CompiledCondition::compile(condition).map_err(|err| rule_error(rule_index, err))
                })
                .collect::<Result<Vec<_>>>()?;
            rules.push(CompiledRule {
                name: rule.name.clone(),
                color: rule.color.clone(),
                logical_op,
                conditions,
            });
        }

        Ok(Self {
            source: rule_set.clone(),
            rules,
        })
    }

    /// First matching rule wins; later rules are not evaluated.
    pub fn classify(&self, tile: TileRef<'_>) -> Classification {
        self.rules
            .iter()
            .position(|rule| rule.matches(tile))
            .map_or(Classification::Default, Classification::Rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.source
    }

    pub fn default_color(&self) -> &str {
        &self.source.default_color
    }

    pub fn rule_name(&self, index: usize) -> Option<&str> {
        self.rules.get(index).and_then(|r| r.name.as_deref())
    }

    pub fn color(&self, classification: Classification) -> &str {
        match classification {
            Classification::Rule(idx) => self
                .rules
                .get(idx)
                .map_or(self.default_color(), |r| r.color.as_str()),
            Classification::Default => self.default_color(),
        }
    }

    /// Every category in report order: rule 0..n, then default.
    pub fn categories(&self) -> impl Iterator<Item = Classification> {
        (0..self.rules.len())
            .map(Classification::Rule)
            .chain(std::iter::once(Classification::Default))
    }
}

fn rule_error(rule_index: usize, err: ConditionError) -> RuleError {
    match err {
        ConditionError::UnknownKey(key) => RuleError::UnknownMetricKey { rule_index, key },
        ConditionError::InvalidOperator { key, op } => RuleError::InvalidOperator {
            rule_index,
            key,
            op,
        },
        ConditionError::InvalidValue { key, expected } => RuleError::InvalidConditionValue {
            rule_index,
            key,
            expected,
        },
    }
}

/// Validate and classify in one step. Prefer compiling once when
/// classifying many tiles.
pub fn classify(tile: TileRef<'_>, rule_set: &RuleSet) -> Result<Classification> {
    Ok(CompiledRuleSet::compile(rule_set)?.classify(tile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Rule;
    use chrono::Utc;
    use tilescope_store::{Condition, SourceFile, TileRecord};

    fn source() -> SourceFile {
        SourceFile {
            id: 1,
            json_filename: "slide.json".to_string(),
            image_directory: String::new(),
            ingested_at: Utc::now(),
            tile_count: 0,
            prediction_model: None,
        }
    }

    fn tile(max_subject_area: f64, edge_density: f64) -> TileRecord {
        let mut record = TileRecord::new(1, 1, "0_0.webp", 0, 0);
        record.max_subject_area = Some(max_subject_area);
        record.edge_density = Some(edge_density);
        record
    }

    fn subject_rule_set() -> RuleSet {
        RuleSet::new("#CCCCCC").with_rule(Rule::new(
            "#0000ff",
            "AND",
            vec![
                Condition::new("max_subject_area", ">=", 456.0),
                Condition::new("edge_density", ">=", 0.01),
            ],
        ))
    }

    #[test]
    fn subject_rule_matches_large_subjects_only() {
        let rules = CompiledRuleSet::compile(&subject_rule_set()).unwrap();
        let src = source();

        let big = tile(1000.0, 0.02);
        assert_eq!(rules.classify(TileRef::new(&big, &src)), Classification::Rule(0));

        let small = tile(100.0, 0.02);
        assert_eq!(rules.classify(TileRef::new(&small, &src)), Classification::Default);
        assert_eq!(rules.color(Classification::Default), "#CCCCCC");
        assert_eq!(rules.color(Classification::Rule(0)), "#0000ff");
    }

    #[test]
    fn rule_order_decides_overlapping_matches() {
        let broad = Rule::new("#00ff00", "OR", vec![Condition::new("edge_density", ">", 0.0)]);
        let narrow = Rule::new("#ff0000", "AND", vec![Condition::new("edge_density", ">", 0.5)]);
        let src = source();
        let record = tile(0.0, 0.9);
        let t = TileRef::new(&record, &src);

        let a = RuleSet::new("#000").with_rule(broad.clone()).with_rule(narrow.clone());
        let b = RuleSet::new("#000").with_rule(narrow).with_rule(broad);
        assert_eq!(classify(t, &a).unwrap(), Classification::Rule(0));
        assert_eq!(classify(t, &b).unwrap(), Classification::Rule(0));
        assert_eq!(
            CompiledRuleSet::compile(&a).unwrap().color(Classification::Rule(0)),
            "#00ff00"
        );
        assert_eq!(
            CompiledRuleSet::compile(&b).unwrap().color(Classification::Rule(0)),
            "#ff0000"
        );

        let mild = tile(0.0, 0.3);
        let t = TileRef::new(&mild, &src);
        assert_eq!(classify(t, &a).unwrap(), Classification::Rule(0));
        assert_eq!(classify(t, &b).unwrap(), Classification::Rule(1));
    }

    #[test]
    fn classify_is_repeatable() {
        let rules = CompiledRuleSet::compile(&subject_rule_set()).unwrap();
        let src = source();
        let record = tile(500.0, 0.5);
        let first = rules.classify(TileRef::new(&record, &src));
        for _ in 0..10 {
            assert_eq!(rules.classify(TileRef::new(&record, &src)), first);
        }
    }

    #[test]
    fn empty_groups_never_match() {
        let rule_set = RuleSet::new("#000")
            .with_rule(Rule::new("#111", "AND", Vec::new()))
            .with_rule(Rule::new("#222", "OR", Vec::new()));
        let src = source();
        let record = tile(1.0, 1.0);
        assert_eq!(
            classify(TileRef::new(&record, &src), &rule_set).unwrap(),
            Classification::Default
        );
    }

    #[test]
    fn or_groups_need_one_present_condition() {
        let rule_set = RuleSet::new("#000").with_rule(Rule::new(
            "#111",
            "or",
            vec![
                Condition::new("entropy", ">", 1.0),
                Condition::new("edge_density", ">", 0.1),
            ],
        ));
        let src = source();
        let record = tile(0.0, 0.2);
        assert_eq!(
            classify(TileRef::new(&record, &src), &rule_set).unwrap(),
            Classification::Rule(0)
        );
    }

    #[test]
    fn validation_names_the_offending_rule_and_key() {
        let rule_set = subject_rule_set().with_rule(Rule::new(
            "#fff",
            "AND",
            vec![Condition::new("blurriness", ">", 1.0)],
        ));
        match CompiledRuleSet::compile(&rule_set).unwrap_err() {
            RuleError::UnknownMetricKey { rule_index, key } => {
                assert_eq!(rule_index, 1);
                assert_eq!(key, "blurriness");
            }
            other => panic!("unexpected error: {other}"),
        }

        let bad_op = RuleSet::new("#000").with_rule(Rule::new(
            "#fff",
            "XOR",
            vec![Condition::new("entropy", ">", 1.0)],
        ));
        assert!(matches!(
            CompiledRuleSet::compile(&bad_op).unwrap_err(),
            RuleError::InvalidLogicalOp { rule_index: 0, .. }
        ));
    }

    #[test]
    fn categories_list_rules_then_default() {
        let rules = CompiledRuleSet::compile(&subject_rule_set()).unwrap();
        let keys: Vec<String> = rules.categories().map(|c| c.key()).collect();
        assert_eq!(keys, vec!["0".to_string(), "default".to_string()]);
    }
}
