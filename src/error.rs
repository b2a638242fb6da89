//! Error types for the cache store and the scan client.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`CacheStore`](crate::cache::CacheStore).
///
/// Recoverable conditions (a corrupt file, a tampered row) are not errors; they
/// come back as [`CacheWarning`](crate::cache::CacheWarning)s. An error here
/// means the operation did not happen.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache at {} is unusable: {reason}", path.display())]
    Unrecoverable { path: PathBuf, reason: String },

    #[error("batch write of {entries} entries rolled back: {source}")]
    BatchWrite {
        entries: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("invalid signing key: {0}")]
    Key(String),
}

/// Errors returned by a [`ScanClient`](crate::client::ScanClient).
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("rate limited by scan service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("scan service error: HTTP {status}")]
    Server { status: u16 },

    #[error("request rejected: HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("extension not found: {0}")]
    NotFound(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("invalid response from scan service: {0}")]
    InvalidResponse(String),

    #[error("scan cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScanError::Timeout
        } else if err.is_decode() {
            ScanError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ScanError::Server {
                status: status.as_u16(),
            }
        } else {
            ScanError::Network(err.to_string())
        }
    }
}
