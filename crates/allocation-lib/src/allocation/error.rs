//! Allocation error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("checkpoint I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize allocation state: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint {path:?} is corrupt: expected checksum {expected}, computed {actual}")]
    CorruptCheckpoint {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("node capacity unavailable: {0}")]
    NodeCapacity(String),
    #[error("{0} is required")]
    MissingComponent(&'static str),
}

impl AllocationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AllocationError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, AllocationError>;
