use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrow::array::{ArrayRef, Date32Array, Float32Array, Float64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Date32Type, Field, Schema};
use chrono::NaiveDate;
use itertools::Itertools;
use loan_collapse::{
    AggregationPolicy, CollapseConfig, CollapsePlan, FieldKind, FieldSpec, RawObservation, SourceSchema, Validity,
    Value,
};
use parquet::arrow::ArrowWriter;

/// Initialise logging once for the test binary
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// First day of a month in 2020
#[must_use]
pub fn month(m: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, m, 1).unwrap()
}

/// Three fields: a monthly balance, a mode-reduced channel and a mean ratio
#[must_use]
pub fn test_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::monthly("upb", FieldKind::Float, -1.0_f32).described("unpaid balance"),
        FieldSpec::fixed("channel", FieldKind::Str, "X", AggregationPolicy::Mode).described("origination channel"),
        FieldSpec::fixed("dti", FieldKind::Float, -1.0_f32, AggregationPolicy::Mean).described("debt to income"),
    ]
}

/// Compiled plan over [`test_fields`]
#[must_use]
pub fn test_plan() -> CollapsePlan {
    CollapsePlan::compile(SourceSchema::new(test_fields())).unwrap()
}

/// One observation of the test fields
#[must_use]
pub fn obs(id: &str, m: u32, upb: f32, channel: &str, dti: f32) -> RawObservation {
    RawObservation::new(
        id,
        month(m),
        vec![Value::Float(upb), Value::from(channel), Value::Float(dti)],
    )
}

/// Loan L1: balances 100, missing, 80; channel B, B, missing; no ratio
#[must_use]
pub fn l1_rows() -> Vec<RawObservation> {
    vec![
        obs("L1", 1, 100.0, "B", -1.0),
        obs("L1", 2, -1.0, "B", -1.0),
        obs("L1", 3, 80.0, "X", -1.0),
    ]
}

/// `loans` loans with `months` months each, shuffled by month
#[must_use]
pub fn portfolio(loans: usize, months: u32) -> Vec<RawObservation> {
    let mut rows = Vec::new();
    for m in 1..=months {
        for loan in 0..loans {
            let id = format!("L{loan:02}");
            let channel = if loan % 2 == 0 { "R" } else { "C" };
            rows.push(obs(&id, m, 1000.0 - m as f32, channel, 30.0 + loan as f32));
        }
    }
    rows
}

/// Run settings for in-memory stores
#[must_use]
pub fn memory_config(concurrency: usize) -> CollapseConfig {
    CollapseConfig::new("memory", "memory")
        .with_concurrency(concurrency)
        .with_batch_size(2)
        .with_progress(false)
}

/// A fresh, empty directory under the system temp dir
#[must_use]
pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let dir = std::env::temp_dir().join(format!("loan-collapse-{name}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Keyed validation string of a row, e.g. `upb:0;channel:1;dti:0`
#[must_use]
pub fn keyed_qa(row: &RawObservation) -> String {
    test_fields()
        .iter()
        .zip(&row.validity)
        .map(|(field, flag)| format!("{}:{}", field.name, u8::from(*flag == Validity::Fail)))
        .join(";")
}

/// Write observations of the test fields as a raw Parquet table
///
/// Balances are stored as `Float64` to exercise widening on read.
pub fn write_raw_parquet(path: &Path, rows: &[RawObservation]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("lnId", DataType::Utf8, false),
        Field::new("month", DataType::Date32, false),
        Field::new("qa", DataType::Utf8, true),
        Field::new("upb", DataType::Float64, true),
        Field::new("channel", DataType::Utf8, true),
        Field::new("dti", DataType::Float32, true),
    ]));
    let float = |row: &RawObservation, i: usize| match row.values[i] {
        Value::Float(x) => Some(x),
        _ => None,
    };
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.entity_id.as_str()))),
        Arc::new(Date32Array::from_iter_values(
            rows.iter().map(|r| Date32Type::from_naive_date(r.period)),
        )),
        Arc::new(StringArray::from_iter_values(rows.iter().map(keyed_qa))),
        Arc::new(rows.iter().map(|r| float(r, 0).map(f64::from)).collect::<Float64Array>()),
        Arc::new(rows.iter().map(|r| r.values[1].as_str()).collect::<StringArray>()),
        Arc::new(rows.iter().map(|r| float(r, 2)).collect::<Float32Array>()),
    ];
    let batch = RecordBatch::try_new(Arc::clone(&schema), columns).unwrap();

    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}
