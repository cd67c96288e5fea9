//! Internal fault types.
//!
//! These never cross a public boundary: each is reclassified into the
//! narrowest [`StatusCode`](crate::StatusCode) where it is caught.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Filesystem, registry and service-manager faults.
#[derive(Error, Debug)]
pub enum SystemError {
    /// Caller lacks the rights for the operation
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Path, key or service does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A system tool produced output that could not be understood
    #[error("unexpected tool output: {0}")]
    Parse(String),

    /// Any other I/O error
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for SystemError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => SystemError::AccessDenied(err.to_string()),
            io::ErrorKind::NotFound => SystemError::NotFound(err.to_string()),
            _ => SystemError::Io(err),
        }
    }
}

/// Failures launching or waiting for an elevated process.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The process could not be started (elevation refused, binary missing)
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    /// The process did not exit within the allowed time
    #[error("{program} did not exit within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The process ended without reporting an exit code
    #[error("{program} terminated without an exit code")]
    NoExitCode { program: String },
}

/// Release discovery and download faults.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Transport level failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// The request did not complete in time
    #[error("request timed out")]
    Timeout,

    /// Body could not be parsed
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Downloaded bytes do not match the published digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout
        } else {
            DownloadError::Http(err.to_string())
        }
    }
}
