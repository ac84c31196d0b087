//! Run orchestration
//!
//! A run numbers the distinct loans of the source, splits them into one
//! contiguous shard per worker and collapses every shard in its own tokio
//! task. Each worker streams its rows, groups them by loan and writes through
//! its own writer. The first failure cancels the remaining workers between
//! loans.

pub mod collapse;
pub mod gate;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use indicatif::ProgressBar;
use rustc_hash::FxHashSet;
use tokio::task::JoinSet;

use crate::config::CollapseConfig;
use crate::error::{CollapseError, Result};
use crate::linkage::{LinkageLookup, NoLinkage};
use crate::model::{ConsolidatedRecord, RawObservation};
use crate::partition::{RowIndex, Shard, ShardFilter, partition};
use crate::schema::CollapsePlan;
use crate::store::{RecordWriter, SourceStore, TargetStore};
use crate::utils::{add_group_progress_bar, create_multi_progress, finish_progress_bar};

pub use collapse::collapse_entity;
pub use gate::SchemaGate;

/// Stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Checking the configuration
    Init,
    /// Enumerating and numbering loans
    RowNumbering,
    /// Creating the output table
    SchemaCreation,
    /// Workers are collapsing their shards
    ParallelCollapse,
    /// All workers have closed their writers
    Drain,
    /// The run succeeded
    Done,
    /// The run failed
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::RowNumbering => "row numbering",
            Self::SchemaCreation => "schema creation",
            Self::ParallelCollapse => "parallel collapse",
            Self::Drain => "drain",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardReport {
    /// Shard number
    pub shard: usize,
    /// Loans collapsed
    pub entities: usize,
    /// Rows read
    pub observations: usize,
    /// Bulk writes issued
    pub batches: usize,
    /// Records the writer reported on close
    pub written: usize,
}

impl ShardReport {
    const fn new(shard: usize) -> Self {
        Self {
            shard,
            entities: 0,
            observations: 0,
            batches: 0,
            written: 0,
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Distinct loans in the source
    pub entities: usize,
    /// Whether this run created the output table
    pub created: bool,
    /// Per-shard outcomes, by shard number
    pub shards: Vec<ShardReport>,
    /// Wall time of the run
    pub elapsed: Duration,
}

impl RunReport {
    /// Total records written
    #[must_use]
    pub fn records(&self) -> usize {
        self.shards.iter().map(|s| s.written).sum()
    }

    /// Total rows read
    #[must_use]
    pub fn observations(&self) -> usize {
        self.shards.iter().map(|s| s.observations).sum()
    }
}

/// State shared by all workers of a run
struct Shared {
    plan: Arc<CollapsePlan>,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    linkage: Arc<dyn LinkageLookup>,
    index: Arc<RowIndex>,
    gate: SchemaGate,
    cancel: AtomicBool,
    create: bool,
    batch_size: usize,
}

/// A collapse run from a source store into a target store
pub struct Pipeline {
    config: CollapseConfig,
    plan: Arc<CollapsePlan>,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    linkage: Arc<dyn LinkageLookup>,
    state: PipelineState,
}

impl Pipeline {
    /// Prepare a run without refinance links
    pub fn new(
        config: CollapseConfig,
        plan: CollapsePlan,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            config,
            plan: Arc::new(plan),
            source,
            target,
            linkage: Arc::new(NoLinkage),
            state: PipelineState::Init,
        }
    }

    /// Resolve refinance links through `linkage`
    #[must_use]
    pub fn with_linkage(mut self, linkage: Arc<dyn LinkageLookup>) -> Self {
        self.linkage = linkage;
        self
    }

    /// Current stage
    #[must_use]
    pub const fn state(&self) -> PipelineState {
        self.state
    }

    /// The compiled plan
    #[must_use]
    pub fn plan(&self) -> &CollapsePlan {
        &self.plan
    }

    fn transition(&mut self, next: PipelineState) {
        log::info!("Pipeline: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run to completion
    ///
    /// Records already written by other shards are left in place when the
    /// run fails.
    pub async fn run(&mut self) -> Result<RunReport> {
        let start = Instant::now();
        match self.execute(start).await {
            Ok(report) => {
                self.transition(PipelineState::Done);
                log::info!(
                    "Collapsed {} rows into {} records in {:?}",
                    report.observations(),
                    report.records(),
                    report.elapsed
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(PipelineState::Failed);
                log::error!("Collapse failed: {e}");
                Err(e)
            }
        }
    }

    async fn execute(&mut self, start: Instant) -> Result<RunReport> {
        self.config.validate()?;
        log::info!("Collapsing {} into {}", self.source.describe(), self.target.describe());
        log::debug!("Configuration: {}", self.config);

        self.transition(PipelineState::RowNumbering);
        let ids = self.source.entity_ids().await?;
        let index = tokio::task::spawn_blocking(move || RowIndex::build(ids))
            .await
            .map_err(|e| CollapseError::partition(format!("row numbering failed: {e}")))?;
        if index.is_empty() {
            return Err(CollapseError::InputEmpty(self.source.describe()));
        }
        let shards = partition(index.len(), self.config.concurrency)?;
        log::info!("Numbered {} loans into {} shards", index.len(), shards.len());

        let gate = if self.config.create {
            self.transition(PipelineState::SchemaCreation);
            SchemaGate::pending()
        } else {
            SchemaGate::open()
        };
        let shared = Arc::new(Shared {
            plan: Arc::clone(&self.plan),
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            linkage: Arc::clone(&self.linkage),
            index: Arc::new(index),
            gate,
            cancel: AtomicBool::new(false),
            create: self.config.create,
            batch_size: self.config.batch_size,
        });

        self.transition(PipelineState::ParallelCollapse);
        let (progress, main_bar) = create_multi_progress(
            shared.index.len() as u64,
            Some("Collapsing loans"),
            self.config.show_progress,
        );
        let mut tasks = JoinSet::new();
        for shard in shards {
            let bar = add_group_progress_bar(&progress, shard.len() as u64, Some(&format!("shard {}", shard.id)));
            tasks.spawn(run_shard(Arc::clone(&shared), shard, bar, main_bar.clone()));
        }

        let mut reports = Vec::new();
        let mut first_error: Option<CollapseError> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome =
                joined.unwrap_or_else(|e| Err(CollapseError::store(format!("shard task failed: {e}"))));
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    shared.cancel.store(true, Ordering::SeqCst);
                    shared.gate.fail();
                    let replaces = match &first_error {
                        None => true,
                        Some(CollapseError::Cancelled(_)) => !matches!(e, CollapseError::Cancelled(_)),
                        Some(_) => false,
                    };
                    if replaces {
                        first_error = Some(e);
                    } else {
                        log::debug!("Further shard failure: {e}");
                    }
                }
            }
        }

        self.transition(PipelineState::Drain);
        if let Some(e) = first_error {
            finish_progress_bar(&main_bar, Some("failed"));
            return Err(e);
        }
        finish_progress_bar(&main_bar, Some("done"));

        reports.sort_by_key(|r| r.shard);
        Ok(RunReport {
            entities: shared.index.len(),
            created: self.config.create,
            shards: reports,
            elapsed: start.elapsed(),
        })
    }
}

async fn run_shard(shared: Arc<Shared>, shard: Shard, bar: ProgressBar, main_bar: ProgressBar) -> Result<ShardReport> {
    let id = shard.id;
    if shared.create && id == 0 {
        shared.gate.create_once(shared.target.as_ref(), shared.plan.output()).await?;
    }
    if shard.is_empty() {
        finish_progress_bar(&bar, Some("empty"));
        return Ok(ShardReport::new(id));
    }
    shared.gate.wait(id).await?;

    let writer = shared.target.writer(id, shared.plan.output()).await?;
    let mut worker = ShardWorker {
        shared: Arc::clone(&shared),
        shard,
        writer,
        pending: Vec::new(),
        report: ShardReport::new(id),
        bar,
        main_bar,
    };
    let outcome = worker.consume().await;
    if outcome.is_err() {
        shared.cancel.store(true, Ordering::SeqCst);
    }

    let ShardWorker {
        writer, mut report, bar, ..
    } = worker;
    let closed = writer.close().await;
    match (outcome, closed) {
        (Err(e), _) | (Ok(()), Err(e)) => {
            finish_progress_bar(&bar, Some("failed"));
            if !matches!(e, CollapseError::Cancelled(_)) {
                log::error!("Shard {id} failed: {e}");
            }
            Err(e)
        }
        (Ok(()), Ok(written)) => {
            report.written = written;
            finish_progress_bar(&bar, Some("done"));
            log::info!(
                "Shard {id}: {} loans from {} rows, {} records written",
                report.entities,
                report.observations,
                report.written
            );
            Ok(report)
        }
    }
}

/// One shard's pass over its rows
struct ShardWorker {
    shared: Arc<Shared>,
    shard: Shard,
    writer: Box<dyn RecordWriter>,
    pending: Vec<ConsolidatedRecord>,
    report: ShardReport,
    bar: ProgressBar,
    main_bar: ProgressBar,
}

impl ShardWorker {
    async fn consume(&mut self) -> Result<()> {
        let filter = ShardFilter::new(Arc::clone(&self.shared.index), self.shard.clone());
        let mut rows = self.shared.source.scan(filter.clone()).await?;
        let mut done: FxHashSet<String> = FxHashSet::default();
        let mut group: Vec<RawObservation> = Vec::new();
        let mut foreign = 0_usize;

        while let Some(row) = rows.try_next().await? {
            if !filter.contains(&row.entity_id) {
                foreign += 1;
                continue;
            }
            self.report.observations += 1;
            if group.first().is_some_and(|first| first.entity_id != row.entity_id) {
                let finished = std::mem::take(&mut group);
                self.finish_group(finished, &mut done).await?;
            }
            if group.is_empty() {
                if self.shared.cancel.load(Ordering::SeqCst) {
                    return Err(CollapseError::Cancelled(self.shard.id));
                }
                if done.contains(&row.entity_id) {
                    return Err(CollapseError::store(format!(
                        "source not grouped by entity: loan {} reappeared in shard {}",
                        row.entity_id, self.shard.id
                    )));
                }
            }
            group.push(row);
        }
        if !group.is_empty() {
            self.finish_group(group, &mut done).await?;
        }
        self.flush().await?;

        if foreign > 0 {
            log::warn!("Shard {}: skipped {foreign} rows of loans outside the shard", self.shard.id);
        }
        Ok(())
    }

    async fn finish_group(&mut self, rows: Vec<RawObservation>, done: &mut FxHashSet<String>) -> Result<()> {
        let Some(entity_id) = rows.first().map(|r| r.entity_id.clone()) else {
            return Ok(());
        };
        let record = collapse_entity(&self.shared.plan, self.shared.linkage.as_ref(), &entity_id, rows)?;
        done.insert(entity_id);
        self.pending.push(record);
        self.report.entities += 1;
        self.bar.inc(1);
        self.main_bar.inc(1);
        if self.pending.len() >= self.shared.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.shared.batch_size));
        self.writer.write(batch).await?;
        self.report.batches += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_for_logs() {
        assert_eq!(PipelineState::RowNumbering.to_string(), "row numbering");
        assert_eq!(PipelineState::ParallelCollapse.to_string(), "parallel collapse");
    }

    #[test]
    fn report_totals_sum_over_shards() {
        let report = RunReport {
            entities: 3,
            created: true,
            shards: vec![
                ShardReport {
                    shard: 0,
                    entities: 2,
                    observations: 5,
                    batches: 1,
                    written: 2,
                },
                ShardReport {
                    shard: 1,
                    entities: 1,
                    observations: 1,
                    batches: 1,
                    written: 1,
                },
            ],
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.records(), 3);
        assert_eq!(report.observations(), 6);
    }
}
