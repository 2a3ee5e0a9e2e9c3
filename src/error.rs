use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::jobs::JobState;

pub type Result<T> = std::result::Result<T, DedupError>;

/// Error type shared by every stage of the dedup worker.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("malformed batch data in {path}: {reason}")]
    Data { path: PathBuf, reason: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A job or index row that does not decode.
    #[error("invalid stored row: {0}")]
    Store(String),
    #[error("interrupted by operator")]
    Interrupted,
    #[error("job {job_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        job_id: i64,
        from: Option<JobState>,
        to: JobState,
    },
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<DedupError>,
    },
}

impl DedupError {
    pub fn data(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DedupError::Data {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Network, database and filesystem failures that may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            DedupError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
            ),
            DedupError::Sqlite(e) => !matches!(
                e,
                rusqlite::Error::QueryReturnedNoRows
                    | rusqlite::Error::InvalidColumnType(..)
                    | rusqlite::Error::InvalidParameterCount(..)
            ),
            DedupError::Postgres(_) | DedupError::Pool(_) => true,
            _ => false,
        }
    }
}

impl From<r2d2::Error> for DedupError {
    fn from(e: r2d2::Error) -> Self {
        DedupError::Pool(e.to_string())
    }
}

impl From<bb8::RunError<tokio_postgres::Error>> for DedupError {
    fn from(e: bb8::RunError<tokio_postgres::Error>) -> Self {
        match e {
            bb8::RunError::User(e) => DedupError::Postgres(e),
            bb8::RunError::TimedOut => DedupError::Pool("timed out waiting for connection".into()),
        }
    }
}
