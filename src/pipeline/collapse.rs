//! Reduce the rows of one loan into its consolidated record

use crate::aggregate::aggregate;
use crate::derive::Derived;
use crate::error::{CollapseError, Result};
use crate::linkage::LinkageLookup;
use crate::model::{ConsolidatedRecord, RawObservation, Value, period_end};
use crate::qa::QaTracker;
use crate::schema::CollapsePlan;

/// Build the record of `entity_id` from all of its rows
///
/// Rows may arrive in any order. Periods are moved to month end, and of two
/// rows for the same month only the first is kept.
pub fn collapse_entity(
    plan: &CollapsePlan,
    linkage: &dyn LinkageLookup,
    entity_id: &str,
    mut rows: Vec<RawObservation>,
) -> Result<ConsolidatedRecord> {
    let width = plan.fields().len();
    if let Some(bad) = rows
        .iter()
        .find(|r| r.values.len() != width || r.validity.len() != width)
    {
        return Err(CollapseError::store(format!(
            "loan {entity_id}: row for {} has {} values and {} flags, expected {width}",
            bad.period,
            bad.values.len(),
            bad.validity.len()
        )));
    }

    for row in &mut rows {
        row.period = period_end(row.period);
    }
    rows.sort_by_key(|r| r.period);
    let before = rows.len();
    rows.dedup_by_key(|r| r.period);
    if rows.len() < before {
        log::debug!("Loan {entity_id}: dropped {} duplicate months", before - rows.len());
    }

    let periods: Vec<_> = rows.iter().map(|r| r.period).collect();
    let mut monthly = Vec::with_capacity(plan.monthly_width());
    for &field in plan.monthly() {
        let spec = &plan.fields()[field];
        let column = rows
            .iter()
            .map(|r| match &r.values[field] {
                Value::Str(s) if spec.lowercase => Value::Str(s.to_lowercase()),
                value => value.clone(),
            })
            .collect();
        monthly.push(column);
    }

    let mut statics = Vec::with_capacity(plan.static_width());
    for &field in plan.statics() {
        let spec = &plan.fields()[field];
        let policy = spec
            .policy()
            .ok_or_else(|| CollapseError::config(format!("Field {} has no aggregation policy", spec.name)))?;
        let reduced = aggregate(policy, &spec.sentinel(), rows.iter().map(|r| &r.values[field]));
        statics.push(reduced.value);
    }

    for derived in plan.derived() {
        let inputs: Vec<Option<&Value>> = derived
            .inputs
            .iter()
            .map(|&field| {
                let value = &statics[plan.static_slot(field)?];
                plan.fields()[field].sentinel().is_valid(value).then_some(value)
            })
            .collect();
        match derived.rule.compute(entity_id, &periods, &inputs) {
            Derived::Scalar(value) => statics.push(value),
            Derived::Monthly(values) => monthly.push(values),
        }
    }

    let mut tracker = QaTracker::new();
    for (field, spec) in plan.fields().iter().enumerate() {
        let mode = spec.qa_mode();
        for row in &rows {
            tracker.record(plan.name(field), mode, row.validity[field]);
        }
    }

    Ok(ConsolidatedRecord {
        entity_id: entity_id.to_string(),
        periods,
        monthly,
        statics,
        qa: tracker.summary(),
        linkage: linkage.resolve(entity_id),
    })
}
