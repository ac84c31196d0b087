use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::Float32Type;
use loan_collapse::store::files::find_parquet_files;
use loan_collapse::{
    CollapseConfig, CollapseError, ParquetSource, ParquetTarget, Pipeline, RawObservation, Validity, Value,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::utils::{init_logging, l1_rows, month, obs, test_plan, temp_dir, write_raw_parquet};

fn read_table(dir: &Path) -> Vec<RecordBatch> {
    let mut batches = Vec::new();
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.extension().is_some_and(|e| e == "parquet")
                && !p.file_name().unwrap().to_string_lossy().starts_with('_')
        })
        .collect();
    files.sort();
    for file in files {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(file).unwrap())
            .unwrap()
            .build()
            .unwrap();
        batches.extend(reader.map(Result::unwrap));
    }
    batches
}

fn raw_rows() -> Vec<RawObservation> {
    let mut rows = l1_rows();
    rows.push(obs("L2", 1, 500.0, "R", 25.0).with_validity(vec![Validity::Pass, Validity::Fail, Validity::Pass]));
    rows.push(obs("L2", 2, 490.0, "R", 25.0).with_validity(vec![Validity::Pass, Validity::Fail, Validity::Pass]));
    rows.push(RawObservation::new(
        "L3",
        month(1),
        vec![Value::from("not a number"), Value::from("C"), Value::Float(40.0)],
    ));
    rows
}

fn config(source: &Path, target: &Path) -> CollapseConfig {
    CollapseConfig::new(source, target)
        .with_concurrency(2)
        .with_batch_size(1)
        .with_progress(false)
}

#[tokio::test]
async fn raw_parquet_round_trip() {
    init_logging();
    let raw = temp_dir("raw");
    let out = temp_dir("out");
    let rows = raw_rows();
    // L1 spans both files
    write_raw_parquet(&raw.join("part-a.parquet"), &rows[..2]);
    write_raw_parquet(&raw.join("part-b.parquet"), &rows[2..]);

    let plan = test_plan();
    let source = ParquetSource::new(&raw, plan.source().clone()).with_batch_size(2);
    let target = ParquetTarget::new(&out).with_run_id("first");
    let mut pipeline = Pipeline::new(config(&raw, &out), plan.clone(), Arc::new(source), Arc::new(target.clone()));
    let report = pipeline.run().await.unwrap();
    assert_eq!(report.records(), 3);

    let batches = read_table(&out);
    assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 3);
    let names: Vec<_> = batches[0].schema().fields().iter().map(|f| f.name().clone()).collect();
    let expected: Vec<_> = plan.output().fields().iter().map(|f| f.name.clone()).collect();
    assert_eq!(names, expected);

    let mut found_l1 = false;
    for batch in &batches {
        let ids = batch.column_by_name("lnId").unwrap().as_string::<i32>();
        let upb = batch.column_by_name("upb").unwrap().as_list::<i32>();
        let failed = batch.column_by_name("qa.field").unwrap().as_list::<i32>();
        for row in 0..batch.num_rows() {
            let balances = upb.value(row);
            let balances = balances.as_primitive::<Float32Type>();
            match ids.value(row) {
                "L1" => {
                    found_l1 = true;
                    assert_eq!(balances.values().to_vec(), vec![100.0, -1.0, 80.0]);
                    assert_eq!(failed.value(row).len(), 0);
                }
                "L2" => {
                    let fields = failed.value(row);
                    assert_eq!(fields.as_string::<i32>().value(0), "channel");
                }
                "L3" => {
                    assert_eq!(balances.value(0), -1.0);
                    let fields = failed.value(row);
                    assert_eq!(fields.as_string::<i32>().value(0), "upb");
                }
                other => panic!("unexpected loan {other}"),
            }
        }
    }
    assert!(found_l1);

    let catalog = target.read_catalog().await.unwrap();
    let upb = catalog.iter().find(|e| e.name == "upb").unwrap();
    assert_eq!(upb.data_type, "Array(Float32)");
    assert_eq!(upb.description, "unpaid balance");
    assert_eq!(upb.missing.as_deref(), Some("-1"));
}

#[tokio::test]
async fn appending_adds_part_files_and_recreating_resets() {
    init_logging();
    let raw = temp_dir("raw-append");
    let out = temp_dir("out-append");
    write_raw_parquet(&raw.join("raw.parquet"), &raw_rows());
    let plan = test_plan();

    let run = |run_id: &'static str, create: bool| {
        let source = ParquetSource::new(&raw, plan.source().clone());
        let target = ParquetTarget::new(&out).with_run_id(run_id);
        Pipeline::new(
            config(&raw, &out).with_create(create),
            plan.clone(),
            Arc::new(source),
            Arc::new(target),
        )
    };

    run("one", true).run().await.unwrap();
    let first = find_parquet_files(&out).await.unwrap().len();
    assert!(first > 0);

    run("two", false).run().await.unwrap();
    assert_eq!(find_parquet_files(&out).await.unwrap().len(), first * 2);

    run("three", true).run().await.unwrap();
    let files = find_parquet_files(&out).await.unwrap();
    assert_eq!(files.len(), first);
    assert!(files.iter().all(|f| f.to_string_lossy().contains("part-three-")));
}

#[tokio::test]
async fn appending_to_a_missing_table_fails() {
    let raw = temp_dir("raw-missing");
    let out = temp_dir("out-missing");
    write_raw_parquet(&raw.join("raw.parquet"), &l1_rows());
    let plan = test_plan();
    let source = ParquetSource::new(&raw, plan.source().clone());
    let mut pipeline = Pipeline::new(
        config(&raw, &out).with_create(false),
        plan,
        Arc::new(source),
        Arc::new(ParquetTarget::new(&out)),
    );
    let err = pipeline.run().await.unwrap_err();
    assert!(matches!(err, CollapseError::Store(_)), "{err}");
}

#[tokio::test]
async fn back_to_back_appends_keep_both_runs() {
    init_logging();
    let raw_a = temp_dir("raw-a");
    let raw_b = temp_dir("raw-b");
    let out = temp_dir("out-back-to-back");
    write_raw_parquet(&raw_a.join("a.parquet"), &[obs("A1", 1, 10.0, "R", 20.0)]);
    write_raw_parquet(&raw_b.join("b.parquet"), &[obs("B1", 1, 30.0, "C", 40.0)]);
    let plan = test_plan();

    for (raw, create) in [(&raw_a, true), (&raw_b, false)] {
        let source = ParquetSource::new(raw, plan.source().clone());
        let mut pipeline = Pipeline::new(
            config(raw, &out).with_create(create),
            plan.clone(),
            Arc::new(source),
            Arc::new(ParquetTarget::new(&out)),
        );
        assert_eq!(pipeline.run().await.unwrap().records(), 1);
    }

    let mut ids: Vec<String> = read_table(&out)
        .iter()
        .flat_map(|batch| {
            let ids = batch.column_by_name("lnId").unwrap().as_string::<i32>();
            ids.iter().flatten().map(str::to_string).collect::<Vec<_>>()
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["A1", "B1"]);
}

#[tokio::test]
async fn reusing_a_run_id_does_not_overwrite_part_files() {
    init_logging();
    let raw = temp_dir("raw-reuse");
    let out = temp_dir("out-reuse");
    write_raw_parquet(&raw.join("raw.parquet"), &l1_rows());
    let plan = test_plan();

    let run = |create: bool| {
        let source = ParquetSource::new(&raw, plan.source().clone());
        Pipeline::new(
            config(&raw, &out).with_create(create),
            plan.clone(),
            Arc::new(source),
            Arc::new(ParquetTarget::new(&out).with_run_id("same")),
        )
    };
    run(true).run().await.unwrap();
    let err = run(false).run().await.unwrap_err();
    assert!(matches!(err, CollapseError::Store(ref msg) if msg.contains("already exists")), "{err}");
    assert_eq!(read_table(&out).iter().map(RecordBatch::num_rows).sum::<usize>(), 1);
}
