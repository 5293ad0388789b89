use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Source file not found: {0}")]
    SourceFileNotFound(String),

    #[error("Duplicate tile in {json_filename} at col={col}, row={row}")]
    DuplicateTile {
        json_filename: String,
        col: u32,
        row: u32,
    },

    #[error("Invalid producer file {path}: {reason}")]
    InvalidProducerFile { path: String, reason: String },

    #[error("Invalid prediction file {path}: {reason}")]
    InvalidPredictionFile { path: String, reason: String },

    #[error("Inconsistent snapshot: {0}")]
    InconsistentSnapshot(String),

    #[error("Unsupported snapshot schema version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },
}

/// Rejection reasons when a `{key, op, value}` triple is compiled against
/// the tile field set. Callers map these onto their own taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionError {
    #[error("unknown field '{0}'")]
    UnknownKey(String),

    #[error("operator '{op}' is not supported for field '{key}'")]
    InvalidOperator { key: String, op: String },

    #[error("value for field '{key}' must be {expected}")]
    InvalidValue { key: String, expected: &'static str },
}

impl ConditionError {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::UnknownKey(key) => key,
            Self::InvalidOperator { key, .. } | Self::InvalidValue { key, .. } => key,
        }
    }
}
