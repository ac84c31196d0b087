//! Conversion between Arrow record batches and the row types
//!
//! Source columns are cast to their declared type with Arrow's safe cast, so
//! a value that cannot be represented becomes null. Nulls are replaced by the
//! field's sentinel and flagged as failed.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayBuilder, ArrayRef, AsArray, BooleanArray, Date32Array, Date32Builder, Float32Array, Float32Builder,
    Int32Array, Int32Builder, ListBuilder, RecordBatch, StringArray, StringBuilder,
};
use arrow::compute::{cast, filter as filter_array, filter_record_batch};
use arrow::datatypes::{DataType, Date32Type, Float32Type, Int32Type};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{CollapseError, Result};
use crate::model::{ConsolidatedRecord, FieldKind, RawObservation, Validity, Value};
use crate::partition::ShardFilter;
use crate::schema::catalog::arrow_type;
use crate::schema::{ColumnSource, FieldSpec, OutputField, OutputSchema};

/// Build a record batch of consolidated records
pub fn records_to_batch(schema: &OutputSchema, records: &[ConsolidatedRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = schema.fields().iter().map(|f| output_column(f, records)).collect();
    Ok(RecordBatch::try_new(schema.to_arrow_schema(), columns)?)
}

fn output_column(field: &OutputField, records: &[ConsolidatedRecord]) -> ArrayRef {
    match field.source {
        ColumnSource::EntityId => Arc::new(StringArray::from_iter_values(records.iter().map(|r| r.entity_id.as_str()))),
        ColumnSource::Periods => {
            let mut builder = ListBuilder::new(Date32Builder::new());
            for record in records {
                for period in &record.periods {
                    builder.values().append_value(Date32Type::from_naive_date(*period));
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
        ColumnSource::Monthly(i) => value_lists(
            field.kind,
            records.iter().map(|r| r.monthly.get(i).map_or(&[][..], Vec::as_slice)),
        ),
        ColumnSource::Scalar(i) => scalars(field.kind, records.iter().map(|r| r.statics.get(i))),
        ColumnSource::ForwardLink => Arc::new(
            records
                .iter()
                .map(|r| r.linkage.forward.as_deref())
                .collect::<StringArray>(),
        ),
        ColumnSource::BackwardLink => Arc::new(
            records
                .iter()
                .map(|r| r.linkage.backward.as_deref())
                .collect::<StringArray>(),
        ),
        ColumnSource::QaFields => string_lists(records.iter().map(|r| r.qa.failing().map(|(name, _)| &**name))),
        ColumnSource::QaCounts => {
            let mut builder = ListBuilder::new(Int32Builder::new());
            for record in records {
                for (_, count) in record.qa.failing() {
                    builder.values().append_value(i32::try_from(count).unwrap_or(i32::MAX));
                }
                builder.append(true);
            }
            Arc::new(builder.finish())
        }
        ColumnSource::SystematicFailures => {
            string_lists(records.iter().map(|r| r.qa.systematic.iter().map(|name| &**name)))
        }
    }
}

fn scalars<'a>(kind: FieldKind, values: impl Iterator<Item = Option<&'a Value>>) -> ArrayRef {
    match kind {
        FieldKind::Float => Arc::new(values.map(|v| v.and_then(as_f32)).collect::<Float32Array>()),
        FieldKind::Int => Arc::new(values.map(|v| v.and_then(as_i32)).collect::<Int32Array>()),
        FieldKind::Str => Arc::new(values.map(|v| v.and_then(Value::as_str)).collect::<StringArray>()),
        FieldKind::Date => Arc::new(values.map(|v| v.and_then(as_days)).collect::<Date32Array>()),
    }
}

fn value_lists<'a>(kind: FieldKind, lists: impl Iterator<Item = &'a [Value]>) -> ArrayRef {
    match kind {
        FieldKind::Float => list_of(Float32Builder::new(), lists, |b, v| b.append_option(as_f32(v))),
        FieldKind::Int => list_of(Int32Builder::new(), lists, |b, v| b.append_option(as_i32(v))),
        FieldKind::Str => list_of(StringBuilder::new(), lists, |b, v| b.append_option(v.as_str())),
        FieldKind::Date => list_of(Date32Builder::new(), lists, |b, v| b.append_option(as_days(v))),
    }
}

fn list_of<'a, B, F>(inner: B, lists: impl Iterator<Item = &'a [Value]>, mut push: F) -> ArrayRef
where
    B: ArrayBuilder,
    F: FnMut(&mut B, &Value),
{
    let mut builder = ListBuilder::new(inner);
    for list in lists {
        for value in list {
            push(builder.values(), value);
        }
        builder.append(true);
    }
    Arc::new(builder.finish())
}

fn string_lists<'a, L, I>(lists: L) -> ArrayRef
where
    L: Iterator<Item = I>,
    I: Iterator<Item = &'a str>,
{
    let mut builder = ListBuilder::new(StringBuilder::new());
    for list in lists {
        for item in list {
            builder.values().append_value(item);
        }
        builder.append(true);
    }
    Arc::new(builder.finish())
}

const fn as_f32(value: &Value) -> Option<f32> {
    match value {
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

const fn as_i32(value: &Value) -> Option<i32> {
    match value {
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

fn as_days(value: &Value) -> Option<i32> {
    value.as_date().map(Date32Type::from_naive_date)
}

/// Positions of the source columns inside a projected batch
#[derive(Debug, Clone)]
pub struct SourceColumns {
    /// Entity id column
    pub id: usize,
    /// Period column
    pub period: usize,
    /// Keyed validation column, if read
    pub qa: Option<usize>,
    /// One column per declared field, parallel to the declarations
    pub fields: Vec<usize>,
}

/// Rows skipped while converting a batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Skipped {
    /// Rows with a null id or period
    pub incomplete: usize,
    /// Rows of entities outside the shard
    pub foreign: usize,
}

/// Convert a batch of source rows into observations
///
/// Rows without an id or period, and rows whose id is rejected by `filter`,
/// are masked out before any field column is converted.
pub fn batch_to_observations(
    batch: &RecordBatch,
    fields: &[FieldSpec],
    columns: &SourceColumns,
    filter: Option<&ShardFilter>,
) -> Result<(Vec<RawObservation>, Skipped)> {
    let ids = cast(batch.column(columns.id), &DataType::Utf8)?;
    let periods = cast(batch.column(columns.period), &DataType::Date32)?;

    let mut skipped = Skipped::default();
    let mask = {
        let ids = ids.as_string::<i32>();
        let keep: Vec<bool> = (0..batch.num_rows())
            .map(|row| {
                if ids.is_null(row) || periods.is_null(row) {
                    skipped.incomplete += 1;
                    false
                } else if filter.is_some_and(|f| !f.contains(ids.value(row))) {
                    skipped.foreign += 1;
                    false
                } else {
                    true
                }
            })
            .collect();
        BooleanArray::from(keep)
    };
    let batch = filter_record_batch(batch, &mask)?;
    let ids = filter_array(&*ids, &mask)?;
    let ids = ids.as_string::<i32>();
    let periods = filter_array(&*periods, &mask)?;
    let periods = periods.as_primitive::<Date32Type>();

    let converted: Vec<Vec<(Value, Validity)>> = columns
        .fields
        .par_iter()
        .zip(fields.par_iter())
        .map(|(&col, spec)| typed_values(batch.column(col), spec))
        .collect::<Result<_>>()?;

    let qa = match columns.qa {
        Some(col) => Some(cast(batch.column(col), &DataType::Utf8)?),
        None => None,
    };
    let qa = qa.as_ref().map(|a| a.as_string::<i32>());

    let mut cells: Vec<_> = converted.into_iter().map(Vec::into_iter).collect();
    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut values = Vec::with_capacity(fields.len());
        let mut validity = Vec::with_capacity(fields.len());
        for column in &mut cells {
            let (value, flag) = column
                .next()
                .ok_or_else(|| CollapseError::store("source column shorter than batch"))?;
            values.push(value);
            validity.push(flag);
        }
        if let Some(keyed) = qa.filter(|q| !q.is_null(row)) {
            let flags = parse_keyed_validity(keyed.value(row));
            for (spec, flag) in fields.iter().zip(validity.iter_mut()) {
                if *flag != Validity::Fail {
                    *flag = flags.get(spec.name.as_str()).copied().unwrap_or(*flag);
                }
            }
        }
        let period = Date32Type::to_naive_date(periods.value(row));
        rows.push(RawObservation::new(ids.value(row), period, values).with_validity(validity));
    }

    Ok((rows, skipped))
}

/// Values of one source column, with nulls replaced by the sentinel
fn typed_values(array: &ArrayRef, spec: &FieldSpec) -> Result<Vec<(Value, Validity)>> {
    let array = cast(array, &arrow_type(spec.kind))?;
    let wrap = |value: Option<Value>| match value {
        Some(value) => (value, Validity::Pass),
        None => (spec.missing.clone(), Validity::Fail),
    };
    let values: Vec<(Value, Validity)> = match spec.kind {
        FieldKind::Float => array
            .as_primitive::<Float32Type>()
            .iter()
            .map(|v| wrap(v.map(Value::Float)))
            .collect(),
        FieldKind::Int => array
            .as_primitive::<Int32Type>()
            .iter()
            .map(|v| wrap(v.map(Value::Int)))
            .collect(),
        FieldKind::Str => array
            .as_string::<i32>()
            .iter()
            .map(|v| wrap(v.map(Value::from)))
            .collect(),
        FieldKind::Date => array
            .as_primitive::<Date32Type>()
            .iter()
            .map(|v| wrap(v.map(|days| Value::Date(Date32Type::to_naive_date(days)))))
            .collect(),
    };
    Ok(values)
}

/// Parse `name:0;name:1`, where `1` marks a failed field
#[must_use]
pub fn parse_keyed_validity(keyed: &str) -> FxHashMap<&str, Validity> {
    keyed
        .split(';')
        .filter_map(|pair| pair.trim().split_once(':'))
        .map(|(name, flag)| {
            let flag = if flag.trim() == "1" { Validity::Fail } else { Validity::Pass };
            (name.trim(), flag)
        })
        .collect()
}
