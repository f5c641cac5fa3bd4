//! Error types for the monitoring pipeline
//!
//! Steady-state errors ([`RecordError`], [`WatchError::Stream`]) are logged and
//! recovered from locally. Only [`WatchError::Establish`] is fatal at startup.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to read or parse the credentials record.
///
/// An absent record is not an error; loaders report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read credentials record {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credentials record {path:?} is malformed: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("failed to write credentials record {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Malfunction of the change source
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path:?}: {source}")]
    Establish {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("change notifications for {path:?} failed: {message}")]
    Stream { path: PathBuf, message: String },
}
