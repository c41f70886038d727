//! Error types for the cohort metrics pipeline

use crate::types::YearMonth;
use thiserror::Error;

/// Errors that can occur while loading tables or computing metrics
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Table '{table}' is missing required column '{column}'")]
    MissingColumn { table: &'static str, column: String },

    #[error("Invalid value in table '{table}' (line {line}): {message}")]
    InvalidValue {
        table: &'static str,
        line: u64,
        message: String,
    },

    #[error("Missing user identifier for cash request {0}")]
    MissingUserId(String),

    #[error("Date parse error: {0}")]
    DateParseError(String),

    #[error("Referential integrity violation: {0}")]
    Referential(String),

    #[error("Degenerate cohort {cohort}: {reason}")]
    DegenerateCohort { cohort: YearMonth, reason: String },

    #[error("Malformed matrix: {0}")]
    MalformedMatrix(String),

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetricsError {
    /// Whether the error belongs to the schema class (bad columns or values)
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            MetricsError::MissingColumn { .. }
                | MetricsError::InvalidValue { .. }
                | MetricsError::MissingUserId(_)
                | MetricsError::DateParseError(_)
        )
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;
