use thiserror::Error;

pub type Result<T> = std::result::Result<T, CorrError>;

#[derive(Error, Debug)]
pub enum CorrError {
    #[error("Observation axes are not aligned: {0}")]
    NotAligned(String),
    #[error("Matrix '{0}' is empty (needs at least one observation and one feature)")]
    EmptyMatrix(String),
    #[error("Non-numeric value '{value}' on line {line}, column {column}")]
    NonNumeric {
        line: usize,
        column: usize,
        value: String,
    },
    #[error("Matrix '{dataset}' holds a non-finite value at observation {row}, feature {column}")]
    NonFinite {
        dataset: String,
        row: usize,
        column: usize,
    },
    #[error("Duplicate feature id '{0}'")]
    DuplicateFeature(String),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),
    #[error("Failed to read or write correlation data: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse matrix file: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to encode correlation table: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode correlation table: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Correlation table is corrupt: {0}")]
    CorruptTable(String),
    #[error("Feature '{0}' is not part of this correlation table")]
    UnknownFeature(String),
    #[error("No correlation table stored for datasets '{0}' and '{1}'")]
    UnknownDataset(String, String),
}

impl From<tempfile::PersistError> for CorrError {
    fn from(err: tempfile::PersistError) -> Self {
        CorrError::Io(err.error)
    }
}
