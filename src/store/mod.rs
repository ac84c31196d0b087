//! Source and target store seams
//!
//! The pipeline only talks to stores through these traits. In-memory stores
//! back the tests; Parquet stores back the binary.

pub mod arrow;
pub mod files;
pub mod memory;
pub mod parquet;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{ConsolidatedRecord, RawObservation};
use crate::partition::ShardFilter;
use crate::schema::OutputSchema;

pub use memory::{MemorySource, MemoryTable, MemoryTarget};
pub use parquet::{ParquetSource, ParquetTarget};

/// Stream of observations for one shard
pub type ObservationStream = BoxStream<'static, Result<RawObservation>>;

/// Where raw monthly observations are read from
pub trait SourceStore: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Every entity id in the extent; duplicates are allowed
    fn entity_ids(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    /// Observations of the entities selected by `filter`
    ///
    /// All rows of one entity must arrive contiguously.
    fn scan(&self, filter: ShardFilter) -> BoxFuture<'_, Result<ObservationStream>>;
}

/// Where consolidated records are written
pub trait TargetStore: Send + Sync {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Create (or replace) the output table
    fn create_schema<'a>(&'a self, schema: &'a OutputSchema) -> BoxFuture<'a, Result<()>>;

    /// Open a writer for one shard; the table must exist
    fn writer<'a>(&'a self, shard: usize, schema: &'a OutputSchema) -> BoxFuture<'a, Result<Box<dyn RecordWriter>>>;
}

/// Bulk writer owned by one shard
pub trait RecordWriter: Send {
    /// Append a batch of records
    fn write(&mut self, records: Vec<ConsolidatedRecord>) -> BoxFuture<'_, Result<()>>;

    /// Flush and release; returns the number of records written
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<usize>>;
}
