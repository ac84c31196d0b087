//! Error handling for the collapse pipeline.
//!
//! Only store, configuration and partition failures are errors. Values that
//! violate their declared type are recovered as QA failures and never reach
//! this type.

pub mod util;

use std::io;
use std::path::{Path, PathBuf};

use arrow::error::ArrowError;
use parquet::errors::ParquetError;

/// Errors that can terminate a collapse run
#[derive(Debug, thiserror::Error)]
pub enum CollapseError {
    /// Invalid field declaration, policy/type combination or run setting
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure reported by the source or target store
    #[error("Store error: {0}")]
    Store(String),

    /// Entity enumeration or shard layout failure
    #[error("Partition error: {0}")]
    Partition(String),

    /// The source extent holds no entities
    #[error("Source extent {0} contains no entities")]
    InputEmpty(String),

    /// The run was cancelled because another shard failed
    #[error("Shard {0} cancelled")]
    Cancelled(usize),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] ParquetError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error with the path that caused it, if known
    #[error("IO error{}: {source}", .path.as_ref().map(|p| format!(" at {}", p.display())).unwrap_or_default())]
    Io {
        /// Path involved in the failing operation
        path: Option<PathBuf>,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl CollapseError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a partition error
    pub fn partition(message: impl Into<String>) -> Self {
        Self::Partition(message.into())
    }

    /// Wrap an IO error together with the path it concerns
    pub fn io_at(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: Some(path.to_path_buf()),
            source,
        }
    }

    /// True for errors raised before any I/O begins
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<io::Error> for CollapseError {
    fn from(source: io::Error) -> Self {
        Self::Io { path: None, source }
    }
}

impl From<serde_arrow::Error> for CollapseError {
    fn from(error: serde_arrow::Error) -> Self {
        Self::Store(format!("Arrow conversion failed: {error}"))
    }
}

/// Result type for collapse operations
pub type Result<T> = std::result::Result<T, CollapseError>;
