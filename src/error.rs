// src/error.rs
// Standardized error taxonomy for agenr (spec.md §7).

use thiserror::Error;

/// Main error type for the agenr library.
///
/// Each variant corresponds to one of the error kinds in spec.md §7; the CLI
/// maps each to a deterministic exit code (see `crate::cli::exit_code_for`).
#[derive(Error, Debug)]
pub enum AgenrError {
    /// Malformed entry or invalid flag combination. Skips a single item; never fatal.
    #[error("validation error in {file}: {reason}")]
    Validation { file: String, reason: String },

    /// HTTP 429/5xx/timeout/"rate limit" from an external collaborator. Retried with backoff.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// 401/403 from an external collaborator. Fatal for the current run.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Raised by `WriteQueue::cancel`.
    #[error("operation cancelled")]
    Cancelled,

    /// Raised by `WriteQueue::destroy` or a signal-driven shutdown.
    #[error("shutdown requested")]
    Shutdown,

    /// Constraint violation or I/O failure while writing storage. Aborts the current batch.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed state/health/config JSON, or a required field missing. Treated as absent, logged.
    #[error("corrupt state in {path}: {reason}")]
    CorruptState { path: String, reason: String },

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pool error: {0}")]
    Pool(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgenrError>;

impl AgenrError {
    /// True for errors the extractor/embedding client retry policy should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgenrError::TransientRemote(_))
    }

    /// Exit code per spec.md §6: 0 success, 1 fatal, 130 shutdown requested.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgenrError::Shutdown => 130,
            _ => 1,
        }
    }
}

impl From<tokio::task::JoinError> for AgenrError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            AgenrError::Cancelled
        } else {
            AgenrError::Storage(err.to_string())
        }
    }
}

impl From<deadpool_sqlite::PoolError> for AgenrError {
    fn from(err: deadpool_sqlite::PoolError) -> Self {
        AgenrError::Pool(err.to_string())
    }
}

impl From<deadpool_sqlite::InteractError> for AgenrError {
    fn from(err: deadpool_sqlite::InteractError) -> Self {
        AgenrError::Pool(err.to_string())
    }
}
