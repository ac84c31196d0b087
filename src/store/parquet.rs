//! Parquet-backed stores
//!
//! The source reads an extent (a file or a directory of part files). The
//! target writes one part file per shard into a directory, next to a
//! `_catalog.parquet` describing the columns. The catalog doubles as the
//! marker that the table exists.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use arrow::array::{AsArray, RecordBatch};
use arrow::compute::cast;
use arrow::datatypes::{DataType, FieldRef, Schema};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt, stream};
use itertools::Itertools;
use parquet::arrow::async_reader::{ParquetRecordBatchStream, ParquetRecordBatchStreamBuilder};
use parquet::arrow::{AsyncArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde_arrow::schema::{SchemaLike, TracingOptions};
use tokio::fs::{self, File, OpenOptions};

use super::arrow::{SourceColumns, batch_to_observations, records_to_batch};
use super::files::{find_parquet_files, open_parquet_file};
use super::{ObservationStream, RecordWriter, SourceStore, TargetStore};
use crate::error::{CollapseError, Result};
use crate::model::{ConsolidatedRecord, RawObservation};
use crate::partition::ShardFilter;
use crate::schema::{CatalogEntry, OutputSchema, SourceSchema};
use crate::utils::{log_operation_complete, log_operation_start, log_warning};

/// Rows per decoded batch
pub const DEFAULT_BATCH_SIZE: usize = 8192;

/// File holding the column catalog of an output table
pub const CATALOG_FILE: &str = "_catalog.parquet";

static RUN_SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// Start time to the microsecond, process id and a per-process sequence
fn unique_run_id() -> String {
    let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{sequence}",
        chrono::Local::now().format("%Y%m%dT%H%M%S%6f"),
        std::process::id()
    )
}

/// Source reading raw monthly observations from Parquet
#[derive(Debug, Clone)]
pub struct ParquetSource {
    path: PathBuf,
    schema: Arc<SourceSchema>,
    batch_size: usize,
}

impl ParquetSource {
    /// Read the extent at `path` with the column layout of `schema`
    ///
    /// Pass the schema of a compiled plan so that sentinels carry their
    /// declared types.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, schema: SourceSchema) -> Self {
        Self {
            path: path.into(),
            schema: Arc::new(schema),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of rows decoded at a time
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Open `file` reading only the named root columns
    async fn open_projected(
        &self,
        file: &Path,
        columns: &[&str],
    ) -> Result<ParquetRecordBatchStream<File>> {
        let builder = ParquetRecordBatchStreamBuilder::new(open_parquet_file(file).await?).await?;
        let file_schema = builder.schema().clone();
        let mut roots = Vec::with_capacity(columns.len());
        for column in columns {
            match file_schema.index_of(column) {
                Ok(index) => roots.push(index),
                Err(_) if Some(*column) == self.schema.qa_field.as_deref() => {
                    log::debug!("{} has no {column} column; all fields pass", file.display());
                }
                Err(_) => {
                    return Err(CollapseError::config(format!(
                        "{} has no column {column}",
                        file.display()
                    )));
                }
            }
        }
        let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
        Ok(builder.with_projection(mask).with_batch_size(self.batch_size).build()?)
    }

    fn scanned_columns(&self) -> Vec<&str> {
        let schema = &self.schema;
        let mut columns = vec![schema.id_field.as_str(), schema.period_field.as_str()];
        columns.extend(schema.qa_field.as_deref());
        columns.extend(schema.fields.iter().map(|f| f.name.as_str()));
        columns
    }
}

/// Locate the source columns in a projected batch
fn locate(schema: &Schema, source: &SourceSchema) -> Result<SourceColumns> {
    let find = |name: &str| {
        schema
            .index_of(name)
            .map_err(|_| CollapseError::store(format!("decoded batch has no column {name}")))
    };
    Ok(SourceColumns {
        id: find(&source.id_field)?,
        period: find(&source.period_field)?,
        qa: source.qa_field.as_deref().and_then(|name| schema.index_of(name).ok()),
        fields: source.fields.iter().map(|f| find(&f.name)).collect::<Result<_>>()?,
    })
}

impl SourceStore for ParquetSource {
    fn describe(&self) -> String {
        format!("parquet source {}", self.path.display())
    }

    fn entity_ids(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        async move {
            let start = Instant::now();
            log_operation_start("Enumerating entities in", &self.path);
            let mut ids: FxHashSet<String> = FxHashSet::default();
            for file in find_parquet_files(&self.path).await? {
                let mut batches = self.open_projected(&file, &[self.schema.id_field.as_str()]).await?;
                while let Some(batch) = batches.try_next().await? {
                    let column = cast(batch.column(0), &DataType::Utf8)?;
                    for id in column.as_string::<i32>().iter().flatten() {
                        if !ids.contains(id) {
                            ids.insert(id.to_string());
                        }
                    }
                }
            }
            log_operation_complete("enumerated", &self.path, ids.len(), Some(start.elapsed()));
            Ok(ids.into_iter().collect())
        }
        .boxed()
    }

    fn scan(&self, filter: ShardFilter) -> BoxFuture<'_, Result<ObservationStream>> {
        async move {
            let start = Instant::now();
            let shard = filter.shard().id;
            let filter = Arc::new(filter);
            let columns = self.scanned_columns();
            let mut rows: Vec<RawObservation> = Vec::new();
            let mut incomplete = 0;

            for file in find_parquet_files(&self.path).await? {
                let mut batches = self.open_projected(&file, &columns).await?;
                while let Some(batch) = batches.try_next().await? {
                    let schema = Arc::clone(&self.schema);
                    let filter = Arc::clone(&filter);
                    let (converted, skipped) = tokio::task::spawn_blocking(move || {
                        let layout = locate(&batch.schema(), &schema)?;
                        batch_to_observations(&batch, &schema.fields, &layout, Some(&*filter))
                    })
                    .await
                    .map_err(|e| CollapseError::store(format!("batch conversion task failed: {e}")))??;
                    incomplete += skipped.incomplete;
                    rows.extend(converted);
                }
            }

            if incomplete > 0 {
                log_warning(
                    &format!("Shard {shard}: skipped {incomplete} rows without id or period"),
                    Some(&self.path),
                );
            }
            // Stable, so duplicate periods keep their file order
            let rows = tokio::task::spawn_blocking(move || {
                rows.par_sort_by(|a, b| (&a.entity_id, a.period).cmp(&(&b.entity_id, b.period)));
                rows
            })
            .await
            .map_err(|e| CollapseError::store(format!("sort task failed: {e}")))?;
            log::debug!(
                "Shard {shard}: read {} observations in {:?}",
                rows.len(),
                start.elapsed()
            );
            Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
        }
        .boxed()
    }
}

/// Target writing the consolidated table as a directory of Parquet files
#[derive(Debug, Clone)]
pub struct ParquetTarget {
    dir: PathBuf,
    run_id: String,
    props: WriterProperties,
}

impl ParquetTarget {
    /// Write into `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            run_id: unique_run_id(),
            props: WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .set_created_by(concat!("loan-collapse ", env!("CARGO_PKG_VERSION")).to_string())
                .build(),
        }
    }

    /// Name part files after `run_id` instead of a generated id
    ///
    /// Writing a part file that already exists is an error, so two runs into
    /// one table need distinct ids.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Output directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the column catalog
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    /// Path of the part file written by `shard`
    #[must_use]
    pub fn part_path(&self, shard: usize) -> PathBuf {
        self.dir.join(format!("part-{}-{shard:04}.parquet", self.run_id))
    }

    /// Read back the catalog of an existing table
    pub async fn read_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let path = self.catalog_path();
        let builder = ParquetRecordBatchStreamBuilder::new(open_parquet_file(&path).await?).await?;
        let batches: Vec<RecordBatch> = builder.build()?.try_collect().await?;
        let mut entries = Vec::new();
        for batch in &batches {
            entries.extend(serde_arrow::from_record_batch::<Vec<CatalogEntry>>(batch)?);
        }
        Ok(entries)
    }

    async fn write_catalog(&self, schema: &OutputSchema) -> Result<()> {
        let entries = schema.catalog_entries();
        let fields = Vec::<FieldRef>::from_type::<CatalogEntry>(TracingOptions::default())?;
        let batch = serde_arrow::to_record_batch(&fields, &entries)?;

        let path = self.catalog_path();
        let file = File::create(&path).await.map_err(|e| CollapseError::io_at(&path, e))?;
        let mut writer = AsyncArrowWriter::try_new(file, batch.schema(), Some(self.props.clone()))?;
        writer.write(&batch).await?;
        writer.close().await?;
        Ok(())
    }
}

impl TargetStore for ParquetTarget {
    fn describe(&self) -> String {
        format!("parquet target {}", self.dir.display())
    }

    fn create_schema<'a>(&'a self, schema: &'a OutputSchema) -> BoxFuture<'a, Result<()>> {
        async move {
            log_operation_start("Creating output table in", &self.dir);
            fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| CollapseError::io_at(&self.dir, e))?;

            let stale = find_parquet_files(&self.dir).await?;
            for file in &stale {
                fs::remove_file(file).await.map_err(|e| CollapseError::io_at(file, e))?;
            }
            if !stale.is_empty() {
                log::info!("Removed {} part files of a previous run", stale.len());
            }

            self.write_catalog(schema).await?;
            log_operation_complete("created", &self.catalog_path(), schema.len(), None);
            Ok(())
        }
        .boxed()
    }

    fn writer<'a>(&'a self, shard: usize, schema: &'a OutputSchema) -> BoxFuture<'a, Result<Box<dyn RecordWriter>>> {
        async move {
            let catalog = self.catalog_path();
            if !fs::try_exists(&catalog).await.unwrap_or(false) {
                return Err(CollapseError::store(format!(
                    "output table {} does not exist; run with create enabled",
                    self.dir.display()
                )));
            }
            let existing = self.read_catalog().await?.into_iter().map(|e| e.name).collect_vec();
            let expected: Vec<&str> = schema.fields().iter().map(|f| f.name.as_str()).collect();
            if existing != expected {
                return Err(CollapseError::store(format!(
                    "output table {} has different columns",
                    self.dir.display()
                )));
            }

            Ok(Box::new(ParquetWriter {
                path: self.part_path(shard),
                schema: schema.clone(),
                props: self.props.clone(),
                writer: None,
                rows: 0,
            }) as Box<dyn RecordWriter>)
        }
        .boxed()
    }
}

/// Writer for one part file, created on the first non-empty write
struct ParquetWriter {
    path: PathBuf,
    schema: OutputSchema,
    props: WriterProperties,
    writer: Option<AsyncArrowWriter<File>>,
    rows: usize,
}

impl RecordWriter for ParquetWriter {
    fn write(&mut self, records: Vec<ConsolidatedRecord>) -> BoxFuture<'_, Result<()>> {
        async move {
            if records.is_empty() {
                return Ok(());
            }
            let batch = records_to_batch(&self.schema, &records)?;
            if self.writer.is_none() {
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&self.path)
                    .await
                    .map_err(|e| match e.kind() {
                        ErrorKind::AlreadyExists => CollapseError::store(format!(
                            "part file {} already exists",
                            self.path.display()
                        )),
                        _ => CollapseError::io_at(&self.path, e),
                    })?;
                self.writer = Some(AsyncArrowWriter::try_new(file, batch.schema(), Some(self.props.clone()))?);
            }
            if let Some(writer) = self.writer.as_mut() {
                writer.write(&batch).await?;
            }
            self.rows += batch.num_rows();
            Ok(())
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<usize>> {
        let Self { path, writer, rows, .. } = *self;
        async move {
            if let Some(writer) = writer {
                writer.close().await?;
                log_operation_complete("wrote", &path, rows, None);
            }
            Ok(rows)
        }
        .boxed()
    }
}
