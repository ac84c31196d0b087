//! In-memory stores for tests and embedding callers

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};

use super::{ObservationStream, RecordWriter, SourceStore, TargetStore};
use crate::error::{CollapseError, Result};
use crate::model::{ConsolidatedRecord, RawObservation};
use crate::partition::ShardFilter;
use crate::schema::OutputSchema;

/// Source backed by a vector of observations
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Arc<Vec<RawObservation>>,
    fail_on: Option<String>,
}

impl MemorySource {
    /// Wrap observations in any order
    #[must_use]
    pub fn new(rows: Vec<RawObservation>) -> Self {
        Self {
            rows: Arc::new(rows),
            fail_on: None,
        }
    }

    /// Make every scan fail when it reaches `entity_id`
    #[must_use]
    pub fn failing_on(mut self, entity_id: impl Into<String>) -> Self {
        self.fail_on = Some(entity_id.into());
        self
    }
}

impl SourceStore for MemorySource {
    fn describe(&self) -> String {
        format!("memory source ({} rows)", self.rows.len())
    }

    fn entity_ids(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let ids = self.rows.iter().map(|r| r.entity_id.clone()).collect();
        async move { Ok(ids) }.boxed()
    }

    fn scan(&self, filter: ShardFilter) -> BoxFuture<'_, Result<ObservationStream>> {
        let rows = Arc::clone(&self.rows);
        let fail_on = self.fail_on.clone();
        async move {
            let mut selected: Vec<RawObservation> =
                rows.iter().filter(|r| filter.contains(&r.entity_id)).cloned().collect();
            selected.sort_by(|a, b| (&a.entity_id, a.period).cmp(&(&b.entity_id, b.period)));

            let stream = stream::iter(selected.into_iter().map(move |row| match &fail_on {
                Some(id) if *id == row.entity_id => {
                    Err(CollapseError::store(format!("read of entity {id} failed")))
                }
                _ => Ok(row),
            }));
            Ok(stream.boxed())
        }
        .boxed()
    }
}

/// Contents of a [`MemoryTarget`]
#[derive(Debug, Default)]
pub struct MemoryTable {
    /// Output schema, once created
    pub schema: Option<OutputSchema>,
    /// Written records, in arrival order
    pub records: Vec<ConsolidatedRecord>,
    /// Number of `create_schema` calls
    pub schema_creations: usize,
    /// Number of `write` calls
    pub batches: usize,
    /// Number of writers closed
    pub closed_writers: usize,
}

/// Target that keeps records in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    table: Arc<Mutex<MemoryTable>>,
}

impl MemoryTarget {
    /// Target without a table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Target whose table already exists
    #[must_use]
    pub fn with_table(schema: OutputSchema) -> Self {
        let target = Self::new();
        if let Ok(mut table) = target.table.lock() {
            table.schema = Some(schema);
        }
        target
    }

    /// Lock the table for inspection
    pub fn table(&self) -> Result<MutexGuard<'_, MemoryTable>> {
        lock(&self.table)
    }

    /// Copy of the written records
    pub fn records(&self) -> Result<Vec<ConsolidatedRecord>> {
        Ok(self.table()?.records.clone())
    }
}

fn lock(table: &Mutex<MemoryTable>) -> Result<MutexGuard<'_, MemoryTable>> {
    table
        .lock()
        .map_err(|_| CollapseError::store("memory table lock poisoned"))
}

impl TargetStore for MemoryTarget {
    fn describe(&self) -> String {
        "memory target".to_string()
    }

    fn create_schema<'a>(&'a self, schema: &'a OutputSchema) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut table = lock(&self.table)?;
            table.schema = Some(schema.clone());
            table.records.clear();
            table.schema_creations += 1;
            Ok(())
        }
        .boxed()
    }

    fn writer<'a>(&'a self, shard: usize, schema: &'a OutputSchema) -> BoxFuture<'a, Result<Box<dyn RecordWriter>>> {
        async move {
            let table = lock(&self.table)?;
            match &table.schema {
                None => Err(CollapseError::store("memory target has no table; create it first")),
                Some(existing) if existing != schema => {
                    Err(CollapseError::store("memory target table has a different schema"))
                }
                Some(_) => Ok(Box::new(MemoryWriter {
                    table: Arc::clone(&self.table),
                    shard,
                    written: 0,
                }) as Box<dyn RecordWriter>),
            }
        }
        .boxed()
    }
}

struct MemoryWriter {
    table: Arc<Mutex<MemoryTable>>,
    shard: usize,
    written: usize,
}

impl RecordWriter for MemoryWriter {
    fn write(&mut self, records: Vec<ConsolidatedRecord>) -> BoxFuture<'_, Result<()>> {
        async move {
            self.written += records.len();
            let mut table = lock(&self.table)?;
            table.records.extend(records);
            table.batches += 1;
            Ok(())
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<usize>> {
        async move {
            lock(&self.table)?.closed_writers += 1;
            log::debug!("Shard {} closed memory writer after {} records", self.shard, self.written);
            Ok(self.written)
        }
        .boxed()
    }
}
