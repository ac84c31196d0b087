//! Refinance links between loan identifiers
//!
//! A loan that was refinanced under the HARP program gets a new id. The map
//! is read once per run and shared read-only by every shard.

use std::path::Path;

use futures::TryStreamExt;
use parquet::arrow::ProjectionMask;
use parquet::arrow::async_reader::ParquetRecordBatchStreamBuilder;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::util::safe_read_to_string;
use crate::error::{CollapseError, Result};
use crate::utils::{log_operation_complete, log_operation_start};

/// Column holding the id before refinancing
pub const OLD_ID_COLUMN: &str = "oldLnId";
/// Column holding the id after refinancing
pub const NEW_ID_COLUMN: &str = "harpLnId";

/// Refinance links of one loan
///
/// `None` means there is no link. An empty string is a real id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linkage {
    /// The loan this one was refinanced into
    pub forward: Option<String>,
    /// The loan this one was refinanced from
    pub backward: Option<String>,
}

/// Lookup of refinance links in both directions
pub trait LinkageLookup: Send + Sync {
    /// The id this loan was refinanced into
    fn forward(&self, id: &str) -> Option<&str>;

    /// The id this loan was refinanced from
    fn backward(&self, id: &str) -> Option<&str>;

    /// Both directions at once
    fn resolve(&self, id: &str) -> Linkage {
        Linkage {
            forward: self.forward(id).map(str::to_string),
            backward: self.backward(id).map(str::to_string),
        }
    }
}

/// Lookup used when the run has no map: no loan has links
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLinkage;

impl LinkageLookup for NoLinkage {
    fn forward(&self, _id: &str) -> Option<&str> {
        None
    }

    fn backward(&self, _id: &str) -> Option<&str> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct LinkRow {
    #[serde(rename = "oldLnId")]
    old: String,
    #[serde(rename = "harpLnId")]
    new: String,
}

/// One-to-one map between pre- and post-refinance ids
#[derive(Debug, Clone, Default)]
pub struct LinkageMap {
    forward: FxHashMap<String, String>,
    backward: FxHashMap<String, String>,
}

impl LinkageMap {
    /// Build from `(old, new)` pairs
    ///
    /// An id appearing twice on the same side is an error.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut map = Self::default();
        for (old, new) in pairs {
            map.insert(old.into(), new.into())?;
        }
        Ok(map)
    }

    fn insert(&mut self, old: String, new: String) -> Result<()> {
        if let Some(existing) = self.forward.get(&old) {
            return Err(CollapseError::config(format!(
                "Loan {old} is mapped to both {existing} and {new}"
            )));
        }
        if let Some(existing) = self.backward.get(&new) {
            return Err(CollapseError::config(format!(
                "Loan {new} is mapped from both {existing} and {old}"
            )));
        }
        self.backward.insert(new.clone(), old.clone());
        self.forward.insert(old, new);
        Ok(())
    }

    /// Read a `old|new` text file, one pair per line
    pub fn from_delimited(path: &Path) -> Result<Self> {
        log_operation_start("Loading linkage map from", path);
        let content = safe_read_to_string(path, "linkage map")?;
        let map = Self::parse_delimited(&content, '|')?;
        log_operation_complete("loaded", path, map.len(), None);
        Ok(map)
    }

    /// Parse delimited text; blank lines are skipped
    pub fn parse_delimited(content: &str, delimiter: char) -> Result<Self> {
        let mut map = Self::default();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split(delimiter).map(str::trim);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(old), Some(new), None) if !old.is_empty() && !new.is_empty() => {
                    map.insert(old.to_string(), new.to_string())?;
                }
                _ => {
                    return Err(CollapseError::config(format!(
                        "Linkage map line {} is not of the form old{delimiter}new: {line:?}",
                        line_no + 1
                    )));
                }
            }
        }
        Ok(map)
    }

    /// Read a Parquet file with `oldLnId` and `harpLnId` string columns
    pub async fn from_parquet(path: &Path) -> Result<Self> {
        let start = std::time::Instant::now();
        log_operation_start("Loading linkage map from", path);

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| CollapseError::io_at(path, e))?;
        let builder = ParquetRecordBatchStreamBuilder::new(file).await?;

        let schema = builder.schema().clone();
        let mut roots = Vec::with_capacity(2);
        for column in [OLD_ID_COLUMN, NEW_ID_COLUMN] {
            let index = schema.index_of(column).map_err(|_| {
                CollapseError::config(format!(
                    "Linkage map {} has no column {column}",
                    path.display()
                ))
            })?;
            roots.push(index);
        }
        let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
        let batches: Vec<_> = builder.with_projection(mask).build()?.try_collect().await?;

        let mut map = Self::default();
        for batch in &batches {
            let rows: Vec<LinkRow> = serde_arrow::from_record_batch(batch)?;
            for row in rows {
                map.insert(row.old, row.new)?;
            }
        }

        log_operation_complete("loaded", path, map.len(), Some(start.elapsed()));
        Ok(map)
    }

    /// Number of links
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True when the map holds no links
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl LinkageLookup for LinkageMap {
    fn forward(&self, id: &str) -> Option<&str> {
        self.forward.get(id).map(String::as_str)
    }

    fn backward(&self, id: &str) -> Option<&str> {
        self.backward.get(id).map(String::as_str)
    }
}
