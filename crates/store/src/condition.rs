use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::ConditionError;
use crate::field::{FieldKind, FieldValue, TileField};
use crate::types::TileRef;

/// Wire form of a single comparison, shared by query filters and rule
/// conditions: `{"key": "edge_density", "op": ">", "value": 0.05}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub key: String,
    pub op: String,
    pub value: ConditionValue,
}

impl Condition {
    pub fn new(key: impl Into<String>, op: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        Self {
            key: key.into(),
            op: op.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(f64),
    Text(String),
}

impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for ConditionValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[must_use]
    pub fn parse(op: &str) -> Option<Self> {
        let op = match op.trim() {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            _ => return None,
        };
        Some(op)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    #[must_use]
    pub fn is_relational(self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }

    /// Single comparison used for every field type. Incomparable operands
    /// (NaN) satisfy no operator, `!=` included.
    pub fn holds<T: PartialOrd + ?Sized>(self, lhs: &T, rhs: &T) -> bool {
        let Some(ordering) = lhs.partial_cmp(rhs) else {
            return false;
        };
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Number(f64),
    Text(String),
}

/// A condition whose key, operator and literal were checked against the
/// field set.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    field: TileField,
    op: CompareOp,
    literal: Literal,
}

impl CompiledCondition {
    pub fn compile(condition: &Condition) -> Result<Self, ConditionError> {
        let field = TileField::parse(&condition.key)
            .ok_or_else(|| ConditionError::UnknownKey(condition.key.clone()))?;
        let op = CompareOp::parse(&condition.op).ok_or_else(|| ConditionError::InvalidOperator {
            key: condition.key.clone(),
            op: condition.op.clone(),
        })?;

        let literal = match (field.kind(), &condition.value) {
            (FieldKind::Text, _) if op.is_relational() => {
                return Err(ConditionError::InvalidOperator {
                    key: condition.key.clone(),
                    op: condition.op.clone(),
                });
            }
            (FieldKind::Text, ConditionValue::Text(text)) => Literal::Text(text.clone()),
            (FieldKind::Text, ConditionValue::Number(_)) => {
                return Err(ConditionError::InvalidValue {
                    key: condition.key.clone(),
                    expected: "a string",
                });
            }
            (_, ConditionValue::Number(number)) => Literal::Number(*number),
            // Form inputs often arrive as strings; accept them when they parse.
            (_, ConditionValue::Text(text)) => match text.trim().parse::<f64>() {
                Ok(number) => Literal::Number(number),
                Err(_) => {
                    return Err(ConditionError::InvalidValue {
                        key: condition.key.clone(),
                        expected: "a number",
                    })
                }
            },
        };

        Ok(Self { field, op, literal })
    }

    #[must_use]
    pub fn field(&self) -> TileField {
        self.field
    }

    #[must_use]
    pub fn op(&self) -> CompareOp {
        self.op
    }

    pub fn matches(&self, tile: TileRef<'_>) -> bool {
        match (&self.literal, tile.get(self.field)) {
            (_, FieldValue::Null) => false,
            (Literal::Number(rhs), value) => value
                .as_number()
                .is_some_and(|lhs| self.op.holds(&lhs, rhs)),
            (Literal::Text(rhs), value) => value
                .as_text()
                .is_some_and(|lhs| self.op.holds(lhs, rhs.as_str())),
        }
    }
}
