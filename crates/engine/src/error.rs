use thiserror::Error;
use tilescope_rules::RuleError;
use tilescope_store::ConditionError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown filter key '{0}'")]
    InvalidFilterKey(String),

    #[error("Operator '{op}' is not supported for '{key}'")]
    InvalidOperator { key: String, op: String },

    #[error("Filter value for '{key}' must be {expected}")]
    InvalidFilterValue { key: String, expected: &'static str },

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("No tile at col={col}, row={row} in '{json_filename}'")]
    TileNotFoundAtCoordinates {
        json_filename: String,
        col: u32,
        row: u32,
    },

    #[error("Source file '{0}' not found")]
    SourceFileNotFound(String),

    #[error("Export matches {total} records, exceeding the limit of {limit}")]
    ExportTooLarge { total: usize, limit: usize },

    #[error("Metric '{0}' is not numeric")]
    NonNumericMetric(String),

    #[error("Grid for '{json_filename}' is {width}x{height}, above the {limit} cell limit")]
    GridTooLarge {
        json_filename: String,
        width: u64,
        height: u64,
        limit: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rules(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<ConditionError> for EngineError {
    fn from(err: ConditionError) -> Self {
        match err {
            ConditionError::UnknownKey(key) => Self::InvalidFilterKey(key),
            ConditionError::InvalidOperator { key, op } => Self::InvalidOperator { key, op },
            ConditionError::InvalidValue { key, expected } => {
                Self::InvalidFilterValue { key, expected }
            }
        }
    }
}
