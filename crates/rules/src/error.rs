use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Rule {rule_index}: unknown metric key '{key}'")]
    UnknownMetricKey { rule_index: usize, key: String },

    #[error("Rule {rule_index}: operator '{op}' is not supported for '{key}'")]
    InvalidOperator {
        rule_index: usize,
        key: String,
        op: String,
    },

    #[error("Rule {rule_index}: value for '{key}' must be {expected}")]
    InvalidConditionValue {
        rule_index: usize,
        key: String,
        expected: &'static str,
    },

    #[error("Rule {rule_index}: logical_op must be AND or OR, got '{op}'")]
    InvalidLogicalOp { rule_index: usize, op: String },

    #[error("Invalid rule set name '{0}'")]
    InvalidRuleSetName(String),

    #[error("Rule set '{0}' not found")]
    RuleSetNotFound(String),

    #[error("Rule set '{0}' already exists")]
    RuleSetNameCollision(String),

    #[error("Rule set '{name}' is unreadable: {reason}")]
    CorruptRuleSet { name: String, reason: String },

    #[error("Rule set store unavailable: {0}")]
    StoreUnavailable(String),
}

impl RuleError {
    /// Transient persistence failures; everything else is a caller error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Validation failures detected before any evaluation.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownMetricKey { .. }
                | Self::InvalidOperator { .. }
                | Self::InvalidConditionValue { .. }
                | Self::InvalidLogicalOp { .. }
                | Self::InvalidRuleSetName(_)
        )
    }
}
