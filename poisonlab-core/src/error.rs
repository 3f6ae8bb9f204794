//! Error types for the poisonlab core.
//!
//! Uses `thiserror` for the public error taxonomy. Validation, duplicate and
//! storage failures are surfaced to callers; oracle failures are recovered
//! locally as zero scores and never leave the engine.

use std::path::PathBuf;

/// Top-level error type for the poisonlab core library.
#[derive(Debug, thiserror::Error)]
pub enum PoisonError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Duplicate upload: file {fingerprint} was already accepted for this session")]
    Duplicate { fingerprint: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoisonError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether the error was caused by the caller's input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::Duplicate { .. }
                | Self::Dataset(DatasetError::Parse { .. } | DatasetError::Empty)
        )
    }
}

/// Errors from loading, parsing and persisting delimited datasets.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Dataset not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Malformed delimited text at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Dataset is empty")]
    Empty,

    #[error("Failed to persist dataset to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read dataset from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the row scoring oracle.
///
/// These are recorded for audit only: the engine converts every variant into
/// a zero score for the affected row.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Oracle request failed: {message}")]
    Request { message: String },

    #[error("Oracle response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for oracle endpoint: {message}")]
    AuthFailed { message: String },

    #[error("Rate limited by oracle, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Oracle timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Oracle returned an invalid score: {raw:?}")]
    InvalidScore { raw: String },
}

/// A type alias for results using the top-level `PoisonError`.
pub type Result<T> = std::result::Result<T, PoisonError>;
