//! Run configuration

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::util::safe_read_to_string;
use crate::error::{CollapseError, Result};

/// Default number of records per bulk write
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Configuration for one collapse run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollapseConfig {
    /// Raw monthly table: a Parquet file or a directory of them
    pub source: PathBuf,
    /// Output directory of the consolidated table
    pub target: PathBuf,
    /// Refinance map, `.txt` (`old|new` lines) or `.parquet`
    pub linkage: Option<PathBuf>,
    /// JSON field declarations; the loan dataset's declarations when unset
    pub schema: Option<PathBuf>,
    /// Create (or replace) the output table before writing
    pub create: bool,
    /// Number of shards processed concurrently
    pub concurrency: usize,
    /// Records per bulk write
    pub batch_size: usize,
    /// Draw progress bars
    pub show_progress: bool,
}

impl Default for CollapseConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            target: PathBuf::new(),
            linkage: None,
            schema: None,
            create: true,
            concurrency: num_cpus::get(),
            batch_size: DEFAULT_BATCH_SIZE,
            show_progress: true,
        }
    }
}

impl CollapseConfig {
    /// Configuration for a run from `source` into `target`
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = safe_read_to_string(path, "configuration")?;
        let config: Self = serde_json::from_str(&content)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Set the refinance map
    #[must_use]
    pub fn with_linkage(mut self, path: impl Into<PathBuf>) -> Self {
        self.linkage = Some(path.into());
        self
    }

    /// Set the field declaration file
    #[must_use]
    pub fn with_schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema = Some(path.into());
        self
    }

    /// Choose whether the output table is created
    #[must_use]
    pub const fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Set the number of shards
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the records per bulk write
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Show or hide progress bars
    #[must_use]
    pub const fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Check the settings before any I/O
    pub fn validate(&self) -> Result<()> {
        if self.source.as_os_str().is_empty() {
            return Err(CollapseError::config("source must not be empty"));
        }
        if self.target.as_os_str().is_empty() {
            return Err(CollapseError::config("target must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(CollapseError::config("concurrency must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(CollapseError::config("batch_size must be at least 1"));
        }
        Ok(())
    }
}

impl fmt::Display for CollapseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({} shards, batches of {}",
            self.source.display(),
            self.target.display(),
            self.concurrency,
            self.batch_size
        )?;
        if let Some(linkage) = &self.linkage {
            write!(f, ", links from {}", linkage.display())?;
        }
        if !self.create {
            write!(f, ", appending")?;
        }
        write!(f, ")")
    }
}
