use serde::{Deserialize, Serialize};
use tilescope_store::Condition;

/// A named classification scheme. This is both the HTTP body and the
/// on-disk file content, so it keeps every field exactly as given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub default_color: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub color: String,
    pub rule_group: RuleGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub logical_op: String,
    pub conditions: Vec<Condition>,
}

impl RuleSet {
    pub fn new(default_color: impl Into<String>) -> Self {
        Self {
            default_color: default_color.into(),
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Rule {
    pub fn new(color: impl Into<String>, logical_op: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            name: None,
            color: color.into(),
            rule_group: RuleGroup {
                logical_op: logical_op.into(),
                conditions,
            },
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
