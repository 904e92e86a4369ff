use std::sync::Arc;
use thiserror::Error;

use crate::wire::WireError;

pub type Result<T> = std::result::Result<T, DnshieldError>;

/// Unified error type for the DNShield filtering core.
///
/// The request path never surfaces these to a DNS client; every failure is
/// converted to a response code before it leaves the proxy. Control-plane
/// callers (command channel, manifest refresh) log them and report through
/// status payloads.
#[derive(Debug, Clone, Error)]
pub enum DnshieldError {
    // Parse errors: always local, never retried
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),
    #[error("Manifest validation error: {0}")]
    ManifestInvalid(String),
    #[error("Rule parse error: {0}")]
    RuleParse(String),
    #[error("Condition parse error: {0}")]
    Condition(String),

    // Network errors
    #[error("Network unavailable")]
    NetworkUnavailable,
    #[error("Operation timed out")]
    Timeout,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("HTTP error {status}")]
    Http { status: u16 },
    #[error("Operation cancelled")]
    Cancelled,

    // Cache errors
    #[error("Disk full")]
    DiskFull,
    #[error("Corrupted cache entry: {0}")]
    Corrupted(String),
    #[error("Failed to acquire lock: {0}")]
    LockFailed(String),

    // Manager errors: fatal until reconfigured
    #[error("Component not initialized")]
    NotInitialized,
    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    // Storage and IO
    #[error("Rule database error: {0}")]
    Database(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),
}

impl DnshieldError {
    /// Whether a failed operation may be retried.
    ///
    /// Auth and not-found HTTP statuses are terminal (they drive the
    /// manifest identifier fall-through instead), as are parse errors,
    /// cancellation and manager misconfiguration. `LockFailed` is the one
    /// retryable cache error.
    pub fn is_retryable(&self) -> bool {
        match self {
            DnshieldError::NetworkUnavailable | DnshieldError::Timeout | DnshieldError::Tls(_) => {
                true
            }
            DnshieldError::Http { status } => *status >= 500,
            DnshieldError::LockFailed(_) => true,
            DnshieldError::Io(_) | DnshieldError::IoError(_) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for DnshieldError {
    fn from(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(28) {
            // ENOSPC
            DnshieldError::DiskFull
        } else {
            DnshieldError::IoError(Arc::new(err))
        }
    }
}

impl From<rusqlite::Error> for DnshieldError {
    fn from(err: rusqlite::Error) -> Self {
        DnshieldError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DnshieldError {
    fn from(err: serde_json::Error) -> Self {
        DnshieldError::ManifestParse(err.to_string())
    }
}
