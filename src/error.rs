//! Error taxonomy for the indexing and clustering engine.
//!
//! Per-item failures (`Io`, `Decode`, `Detection`, `Store`) are recorded against
//! the photo that caused them and reported through the scan event stream. Only
//! a fatal [`StoreError`] aborts a whole run.

use std::path::PathBuf;
use thiserror::Error;

/// Failure of the persistent index.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Index store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt index record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the store can no longer be used at all (as opposed to a single
    /// failed statement).
    pub fn is_fatal(&self) -> bool {
        use rusqlite::ErrorCode;

        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Corrupt(_) => false,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::SystemIoFailure
            ),
            StoreError::Sqlite(_) => false,
        }
    }
}

/// Errors surfaced by the scanner, the provider and the clustering engine.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot decode image: {0}")]
    Decode(String),

    #[error("No face detection backend available (tried: {tried})")]
    DetectorUnavailable { tried: String },

    #[error("Face detection failed: {0}")]
    Detection(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Person {0} is named; merging it requires explicit confirmation")]
    MergeRequiresConfirmation(i64),

    #[error("{0} not found")]
    NotFound(String),
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::Io { .. } => ErrorKind::Io,
            IndexError::Decode(_) => ErrorKind::Decode,
            IndexError::DetectorUnavailable { .. } => ErrorKind::DetectorUnavailable,
            IndexError::Detection(_) => ErrorKind::Detection,
            IndexError::Store(_) => ErrorKind::Store,
            IndexError::MergeRequiresConfirmation(_) | IndexError::NotFound(_) => ErrorKind::Usage,
        }
    }
}

/// Coarse error category carried by events and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Decode,
    DetectorUnavailable,
    Detection,
    Store,
    Usage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Decode => "decode",
            ErrorKind::DetectorUnavailable => "detector-unavailable",
            ErrorKind::Detection => "detection",
            ErrorKind::Store => "store",
            ErrorKind::Usage => "usage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = IndexError::io("/tmp/x.jpg", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(IndexError::Decode("bad".into()).kind(), ErrorKind::Decode);
        assert_eq!(
            IndexError::Store(StoreError::Corrupt("x".into())).kind(),
            ErrorKind::Store
        );
    }

    #[test]
    fn test_store_error_fatality() {
        assert!(StoreError::Unavailable("gone".into()).is_fatal());
        assert!(!StoreError::Corrupt("bad blob".into()).is_fatal());
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_fatal());
    }
}
