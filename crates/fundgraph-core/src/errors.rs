//! Error types for the fundgraph core library.

/// Top-level error enum for the fundgraph core library.
///
/// Row-, table- and identity-level problems are not errors: they are collected
/// as [`crate::models::IngestionIssue`] values in a document report. Only
/// document-level failures surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum FundGraphError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid period {year}-{month:02}")]
    InvalidPeriod { year: i32, month: u32 },

    #[error("Text normalization unavailable after {attempts} attempt(s): {message}")]
    NormalizationUnavailable { attempts: u32, message: String },

    #[error("Snapshot already exists for fund {fund_id} at {year}-{month:02}")]
    SnapshotExists {
        fund_id: String,
        year: i32,
        month: u32,
    },

    #[error("Commit failed for fund {fund_id}: {message}")]
    CommitFailure { fund_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type FundGraphResult<T> = Result<T, FundGraphError>;
