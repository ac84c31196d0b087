use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use loan_collapse::store::ObservationStream;
use loan_collapse::{
    CollapseError, LinkageMap, Result, MemorySource, MemoryTarget, Pipeline, PipelineState, RawObservation, ShardFilter,
    SourceStore, Validity, Value,
};

use crate::utils::{init_logging, l1_rows, memory_config, month, obs, portfolio, test_plan};

#[tokio::test]
async fn loan_l1_collapses_into_one_record() {
    init_logging();
    let target = MemoryTarget::new();
    let plan = test_plan();
    let mut pipeline = Pipeline::new(
        memory_config(1),
        plan.clone(),
        Arc::new(MemorySource::new(l1_rows())),
        Arc::new(target.clone()),
    );
    let report = pipeline.run().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(report.records(), 1);

    let records = target.records().unwrap();
    let record = &records[0];
    assert_eq!(record.entity_id, "L1");
    assert_eq!(record.months(), 3);
    assert_eq!(
        plan.monthly_values(record, "upb").unwrap(),
        &[Value::Float(100.0), Value::Float(-1.0), Value::Float(80.0)]
    );
    assert_eq!(plan.scalar_value(record, "channel"), Some(&Value::from("B")));
    assert_eq!(plan.scalar_value(record, "dti"), Some(&Value::Float(-1.0)));
    assert!(record.qa.is_clean());
}

#[tokio::test]
async fn ten_loans_over_four_shards() {
    init_logging();
    let target = MemoryTarget::new();
    let mut pipeline = Pipeline::new(
        memory_config(4),
        test_plan(),
        Arc::new(MemorySource::new(portfolio(10, 3))),
        Arc::new(target.clone()),
    );
    let report = pipeline.run().await.unwrap();

    let per_shard: Vec<_> = report.shards.iter().map(|s| s.entities).collect();
    assert_eq!(per_shard, vec![3, 3, 2, 2]);
    assert_eq!(report.entities, 10);
    assert_eq!(report.records(), 10);
    assert_eq!(report.observations(), 30);

    let records = target.records().unwrap();
    let ids: BTreeSet<_> = records.iter().map(|r| r.entity_id.clone()).collect();
    assert_eq!(ids.len(), 10);
    assert!(records.iter().all(|r| r.months() == 3));

    let table = target.table().unwrap();
    assert_eq!(table.schema_creations, 1);
    assert_eq!(table.closed_writers, 4);
}

#[tokio::test]
async fn more_shards_than_loans_still_creates_once() {
    init_logging();
    let target = MemoryTarget::new();
    let mut pipeline = Pipeline::new(
        memory_config(8),
        test_plan(),
        Arc::new(MemorySource::new(portfolio(3, 2))),
        Arc::new(target.clone()),
    );
    let report = pipeline.run().await.unwrap();
    assert_eq!(report.shards.len(), 8);
    assert_eq!(report.records(), 3);
    assert_eq!(target.table().unwrap().schema_creations, 1);
}

#[tokio::test]
async fn a_failing_shard_fails_the_run() {
    init_logging();
    let source = MemorySource::new(portfolio(10, 3)).failing_on("L05");
    let mut pipeline = Pipeline::new(
        memory_config(4),
        test_plan(),
        Arc::new(source),
        Arc::new(MemoryTarget::new()),
    );
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, CollapseError::Store(ref msg) if msg.contains("L05")), "{err}");
    assert_eq!(pipeline.state(), PipelineState::Failed);
}

#[tokio::test]
async fn appending_requires_an_existing_table() {
    init_logging();
    let mut pipeline = Pipeline::new(
        memory_config(2).with_create(false),
        test_plan(),
        Arc::new(MemorySource::new(l1_rows())),
        Arc::new(MemoryTarget::new()),
    );
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, CollapseError::Store(_)));

    let plan = test_plan();
    let target = MemoryTarget::with_table(plan.output().clone());
    let mut pipeline = Pipeline::new(
        memory_config(2).with_create(false),
        plan,
        Arc::new(MemorySource::new(l1_rows())),
        Arc::new(target.clone()),
    );
    pipeline.run().await.unwrap();
    assert_eq!(target.table().unwrap().schema_creations, 0);
    assert_eq!(target.records().unwrap().len(), 1);
}

#[tokio::test]
async fn empty_source_is_reported() {
    let mut pipeline = Pipeline::new(
        memory_config(2),
        test_plan(),
        Arc::new(MemorySource::new(Vec::new())),
        Arc::new(MemoryTarget::new()),
    );
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, CollapseError::InputEmpty(_)));
}

#[tokio::test]
async fn zero_shards_is_a_configuration_error() {
    let mut pipeline = Pipeline::new(
        memory_config(0),
        test_plan(),
        Arc::new(MemorySource::new(l1_rows())),
        Arc::new(MemoryTarget::new()),
    );
    assert!(pipeline.run().await.unwrap_err().is_config());
}

#[tokio::test]
async fn links_and_failures_reach_the_record() {
    init_logging();
    let rows = vec![
        obs("L1", 1, 100.0, "B", 20.0).with_validity(vec![Validity::Fail, Validity::Pass, Validity::Fail]),
        obs("L1", 2, 90.0, "B", 20.0).with_validity(vec![Validity::Pass, Validity::Pass, Validity::Fail]),
        obs("L2", 1, 50.0, "R", 10.0),
    ];
    let links = LinkageMap::from_pairs([("L1", "L2")]).unwrap();
    let target = MemoryTarget::new();
    let mut pipeline = Pipeline::new(
        memory_config(1),
        test_plan(),
        Arc::new(MemorySource::new(rows)),
        Arc::new(target.clone()),
    )
    .with_linkage(Arc::new(links));
    pipeline.run().await.unwrap();

    let mut records = target.records().unwrap();
    records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    let (l1, l2) = (&records[0], &records[1]);

    assert_eq!(l1.linkage.forward.as_deref(), Some("L2"));
    assert_eq!(l1.linkage.backward, None);
    assert_eq!(l2.linkage.backward.as_deref(), Some("L1"));
    assert_eq!(l2.linkage.forward, None);

    assert_eq!(l1.qa.failures_of("upb"), Some(1));
    assert!(!l1.qa.is_systematic("upb"));
    assert_eq!(l1.qa.failures_of("dti"), Some(1));
    assert!(l1.qa.is_systematic("dti"));
    assert!(l2.qa.is_clean());
}

/// Source that streams rows exactly as given
struct Unsorted(Vec<RawObservation>);

impl SourceStore for Unsorted {
    fn describe(&self) -> String {
        "unsorted".to_string()
    }

    fn entity_ids(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let ids = self.0.iter().map(|r| r.entity_id.clone()).collect();
        async move { Ok(ids) }.boxed()
    }

    fn scan(&self, _filter: ShardFilter) -> BoxFuture<'_, Result<ObservationStream>> {
        let rows = self.0.clone();
        async move { Ok(stream::iter(rows.into_iter().map(Ok)).boxed()) }.boxed()
    }
}

#[tokio::test]
async fn interleaved_loans_are_rejected() {
    let rows = vec![
        obs("L1", 1, 1.0, "B", 1.0),
        obs("L2", 1, 1.0, "B", 1.0),
        obs("L1", 2, 1.0, "B", 1.0),
    ];
    let mut pipeline = Pipeline::new(
        memory_config(1),
        test_plan(),
        Arc::new(Unsorted(rows)),
        Arc::new(MemoryTarget::new()),
    );
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, CollapseError::Store(ref msg) if msg.contains("reappeared")), "{err}");
}

#[tokio::test]
async fn rows_of_other_shards_are_skipped() {
    init_logging();
    let rows = vec![obs("L1", 1, 1.0, "B", 1.0), obs("L2", 1, 2.0, "C", 2.0)];
    let target = MemoryTarget::new();
    let mut pipeline = Pipeline::new(
        memory_config(2),
        test_plan(),
        Arc::new(Unsorted(rows)),
        Arc::new(target.clone()),
    );
    let report = pipeline.run().await.unwrap();
    assert_eq!(report.records(), 2);
    assert_eq!(report.observations(), 2);
    assert!(target.records().unwrap().iter().all(|r| r.periods[0] > month(1)));
}

/// Source whose shard holding `broken` fails at once while other shards
/// deliver one row per `delay`
struct Throttled {
    rows: Vec<RawObservation>,
    broken: &'static str,
    delay: Duration,
}

impl SourceStore for Throttled {
    fn describe(&self) -> String {
        "throttled".to_string()
    }

    fn entity_ids(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let ids = self.rows.iter().map(|r| r.entity_id.clone()).collect();
        async move { Ok(ids) }.boxed()
    }

    fn scan(&self, filter: ShardFilter) -> BoxFuture<'_, Result<ObservationStream>> {
        let mut rows: Vec<RawObservation> =
            self.rows.iter().filter(|r| filter.contains(&r.entity_id)).cloned().collect();
        rows.sort_by(|a, b| (&a.entity_id, a.period).cmp(&(&b.entity_id, b.period)));
        let broken = self.broken;
        let delay = self.delay;
        async move {
            let rows: ObservationStream = if filter.contains(broken) {
                let failure = CollapseError::store(format!("read of entity {broken} failed"));
                stream::iter([Err(failure)]).boxed()
            } else {
                stream::iter(rows)
                    .then(move |row| async move {
                        tokio::time::sleep(delay).await;
                        Ok(row)
                    })
                    .boxed()
            };
            Ok(rows)
        }
        .boxed()
    }
}

#[tokio::test]
async fn a_failure_stops_the_other_shards_between_loans() {
    init_logging();
    // Shard 0 (L00..L09) fails at once, shard 1 (L10..L19) trickles in
    let source = Throttled {
        rows: portfolio(20, 1),
        broken: "L00",
        delay: Duration::from_millis(50),
    };
    let target = MemoryTarget::new();
    let mut pipeline = Pipeline::new(
        memory_config(2).with_batch_size(1),
        test_plan(),
        Arc::new(source),
        Arc::new(target.clone()),
    );

    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, CollapseError::Store(ref msg) if msg.contains("L00")), "{err}");
    assert_eq!(pipeline.state(), PipelineState::Failed);

    let written = target.records().unwrap();
    assert!(written.len() < 10, "slow shard wrote all {} loans", written.len());
    assert!(written.iter().all(|r| r.entity_id.as_str() >= "L10"));
    assert_eq!(target.table().unwrap().closed_writers, 2);
}
