//! Error taxonomy for the ingestion pipeline

use thiserror::Error;

/// Result type used throughout the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure classes of a pipeline run.
///
/// `Connection` and `Transfer` abort the remote-fetch branch; `Parse` and
/// `Persistence` abort the current batch with no partial commit; `Archive`
/// leaves the source files in place for a retry. Notification problems are
/// handled inside the notifier and never surface as a run failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// VPN tunnel unreachable, command timeout or non-zero exit
    #[error("connection failure: {0}")]
    Connection(String),

    /// FTP session or per-file transfer error
    #[error("transfer failure: {0}")]
    Transfer(String),

    /// Malformed export file
    #[error("parse failure: {0}")]
    Parse(String),

    /// Constraint or I/O error during upsert (wraps rusqlite::Error)
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// I/O error while compressing or removing a processed batch
    #[error("archive failure: {0}")]
    Archive(String),

    /// SMTP compose or send error (caught by the notifier, logged only)
    #[error("notification failure: {0}")]
    Notification(String),

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<csv::Error> for PipelineError {
    fn from(e: csv::Error) -> Self {
        PipelineError::Parse(e.to_string())
    }
}
