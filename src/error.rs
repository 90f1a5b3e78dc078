//! Errors surfaced to callers of the sync engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::document::codec::CodecError;
use crate::index::IndexError;
use crate::watcher::WatchError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A transient lock error outlived every retry.
    #[error("Gave up writing '{title}' to {path} after {attempts} attempts: {source}")]
    RetriesExhausted {
        title: String,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A write failed with an error that is not worth retrying.
    #[error("Failed to write '{title}' to {path}: {source}")]
    Write {
        title: String,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete '{title}' at {path}: {source}")]
    Delete {
        title: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Index lookup failed: {0}")]
    Index(#[from] IndexError),

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Document format error: {0}")]
    Codec(#[from] CodecError),

    #[error("Watcher error: {0}")]
    Watch(#[from] WatchError),
}

impl SyncError {
    /// Number of write attempts behind this error, when it came from a save.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } | Self::Write { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
