use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortfolioError {
    #[error("Data source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Timed out after {seconds}s while contacting data source '{source_id}'")]
    SourceTimeout { source_id: String, seconds: u64 },

    #[error("Table '{table}' is missing required columns: {}", .missing.join(", "))]
    SchemaMismatch { table: String, missing: Vec<String> },

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PortfolioError>;
