//! Compilation of field declarations into a collapse plan
//!
//! Every misconfiguration (duplicate names, sentinels of the wrong type,
//! policies that cannot reduce a field's type, derived columns reading
//! unknown inputs) is reported here, before any row is read.

use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use super::catalog::{ColumnShape, ColumnSource, OutputField, OutputSchema};
use super::field::{FieldRole, FieldSpec};
use crate::derive::{DerivedRule, DerivedSpec};
use crate::error::util::safe_read_to_string;
use crate::error::{CollapseError, Result};
use crate::model::{ConsolidatedRecord, FieldKind, Value};

/// Column name of the QA field list
pub const QA_FIELD_COLUMN: &str = "qa.field";
/// Column name of the QA failure counts
pub const QA_COUNT_COLUMN: &str = "qa.cntFail";
/// Column name of the systematic failure list
pub const ALL_FAIL_COLUMN: &str = "allFail";

fn default_id_field() -> String {
    "lnId".to_string()
}

fn default_period_field() -> String {
    "month".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_qa_field() -> Option<String> {
    Some("qa".to_string())
}

fn default_forward_link() -> String {
    "harpLnId".to_string()
}

fn default_backward_link() -> String {
    "preHarpId".to_string()
}

/// Declaration of a source dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSchema {
    /// Entity id column
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Period column
    #[serde(default = "default_period_field")]
    pub period_field: String,
    /// Column with upstream validation results, if any
    #[serde(default = "default_qa_field")]
    pub qa_field: Option<String>,
    /// Source fields in column order
    pub fields: Vec<FieldSpec>,
    /// Derived columns, computed after aggregation
    #[serde(default)]
    pub derived: Vec<DerivedSpec>,
    /// Output column for the forward refinance link
    #[serde(default = "default_forward_link")]
    pub forward_link: String,
    /// Output column for the backward refinance link
    #[serde(default = "default_backward_link")]
    pub backward_link: String,
}

impl SourceSchema {
    /// Declaration with default column names and no derived columns
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            id_field: default_id_field(),
            period_field: default_period_field(),
            qa_field: default_qa_field(),
            fields,
            derived: Vec::new(),
            forward_link: default_forward_link(),
            backward_link: default_backward_link(),
        }
    }

    /// Add derived columns
    #[must_use]
    pub fn with_derived(mut self, derived: Vec<DerivedSpec>) -> Self {
        self.derived = derived;
        self
    }

    /// Set the validation column, or `None` when the source has none
    #[must_use]
    pub fn with_qa_field(mut self, qa_field: Option<&str>) -> Self {
        self.qa_field = qa_field.map(str::to_string);
        self
    }

    /// Load a declaration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = safe_read_to_string(path, "source schema")?;
        let schema = serde_json::from_str(&content)?;
        Ok(schema)
    }

    /// Position of a source field
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// Where a derived column is stored in a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// `monthly[i]`
    Monthly(usize),
    /// `statics[i]`
    Scalar(usize),
}

/// A derived column with its inputs resolved
#[derive(Debug, Clone)]
pub struct CompiledDerived {
    /// Column name
    pub name: String,
    /// Computation
    pub rule: DerivedRule,
    /// Source field index of each input
    pub inputs: Vec<usize>,
    /// Destination in the record
    pub slot: Slot,
}

/// Validated declaration plus the layout of the consolidated record
#[derive(Debug, Clone)]
pub struct CollapsePlan {
    source: SourceSchema,
    names: Vec<Arc<str>>,
    monthly: Vec<usize>,
    statics: Vec<usize>,
    static_slot: Vec<Option<usize>>,
    derived: Vec<CompiledDerived>,
    output: OutputSchema,
}

impl CollapsePlan {
    /// Validate a declaration and lay out the output
    pub fn compile(mut source: SourceSchema) -> Result<Self> {
        check_names(&source)?;

        for field in &mut source.fields {
            field.missing = coerce(&field.name, field.missing.clone(), field.kind)?;
            let codes = std::mem::take(&mut field.also_missing);
            field.also_missing = codes
                .into_iter()
                .map(|code| coerce(&field.name, code, field.kind))
                .collect::<Result<_>>()?;

            match &field.role {
                FieldRole::Static(policy) if !policy.supports(field.kind) => {
                    return Err(CollapseError::config(format!(
                        "Field {}: policy {policy} cannot reduce {} values",
                        field.name, field.kind
                    )));
                }
                FieldRole::Static(_) | FieldRole::Excluded if field.lowercase => {
                    return Err(CollapseError::config(format!(
                        "Field {}: only monthly fields can be lowercased",
                        field.name
                    )));
                }
                _ => {}
            }
            if field.lowercase && field.kind != FieldKind::Str {
                return Err(CollapseError::config(format!(
                    "Field {}: only string fields can be lowercased",
                    field.name
                )));
            }
        }

        let names = source.fields.iter().map(|f| Arc::from(f.name.as_str())).collect();
        let monthly: Vec<usize> = indices(&source.fields, |r| matches!(r, FieldRole::Monthly));
        let statics: Vec<usize> = indices(&source.fields, |r| matches!(r, FieldRole::Static(_)));
        let mut static_slot = vec![None; source.fields.len()];
        for (slot, &field) in statics.iter().enumerate() {
            static_slot[field] = Some(slot);
        }

        let mut derived = Vec::with_capacity(source.derived.len());
        let (mut next_monthly, mut next_scalar) = (monthly.len(), statics.len());
        for spec in &source.derived {
            let mut inputs = Vec::new();
            for (name, kinds) in spec.rule.inputs() {
                let index = source
                    .index_of(name)
                    .filter(|&i| static_slot[i].is_some())
                    .ok_or_else(|| {
                        CollapseError::config(format!(
                            "Derived column {}: input {name} is not a static field",
                            spec.name
                        ))
                    })?;
                let kind = source.fields[index].kind;
                if !kinds.contains(&kind) {
                    return Err(CollapseError::config(format!(
                        "Derived column {}: input {name} has type {kind}",
                        spec.name
                    )));
                }
                inputs.push(index);
            }
            let slot = if spec.rule.is_monthly() {
                next_monthly += 1;
                Slot::Monthly(next_monthly - 1)
            } else {
                next_scalar += 1;
                Slot::Scalar(next_scalar - 1)
            };
            derived.push(CompiledDerived {
                name: spec.name.clone(),
                rule: spec.rule.clone(),
                inputs,
                slot,
            });
        }

        let output = layout(&source, &monthly, &statics, &derived);
        log::debug!(
            "Compiled plan: {} monthly, {} static, {} derived, {} output columns",
            monthly.len(),
            statics.len(),
            derived.len(),
            output.len()
        );

        Ok(Self {
            source,
            names,
            monthly,
            statics,
            static_slot,
            derived,
            output,
        })
    }

    /// The validated declaration
    #[must_use]
    pub const fn source(&self) -> &SourceSchema {
        &self.source
    }

    /// Source field declarations
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.source.fields
    }

    /// Shared name of a source field, used as QA key
    #[must_use]
    pub fn name(&self, field: usize) -> &Arc<str> {
        &self.names[field]
    }

    /// Source field index of each monthly source column
    #[must_use]
    pub fn monthly(&self) -> &[usize] {
        &self.monthly
    }

    /// Source field index of each static source column
    #[must_use]
    pub fn statics(&self) -> &[usize] {
        &self.statics
    }

    /// Position in `statics` of a static source field
    #[must_use]
    pub fn static_slot(&self, field: usize) -> Option<usize> {
        self.static_slot.get(field).copied().flatten()
    }

    /// Derived columns in declaration order
    #[must_use]
    pub fn derived(&self) -> &[CompiledDerived] {
        &self.derived
    }

    /// Number of monthly sequences in a record
    #[must_use]
    pub fn monthly_width(&self) -> usize {
        self.monthly.len() + self.derived.iter().filter(|d| matches!(d.slot, Slot::Monthly(_))).count()
    }

    /// Number of scalar values in a record
    #[must_use]
    pub fn static_width(&self) -> usize {
        self.statics.len() + self.derived.iter().filter(|d| matches!(d.slot, Slot::Scalar(_))).count()
    }

    /// Columns of the consolidated table
    #[must_use]
    pub const fn output(&self) -> &OutputSchema {
        &self.output
    }

    /// Sequence of a monthly column of `record`
    #[must_use]
    pub fn monthly_values<'r>(&self, record: &'r ConsolidatedRecord, name: &str) -> Option<&'r [Value]> {
        match self.output.field(name)?.source {
            ColumnSource::Monthly(i) => record.monthly.get(i).map(Vec::as_slice),
            _ => None,
        }
    }

    /// Value of a scalar column of `record`
    #[must_use]
    pub fn scalar_value<'r>(&self, record: &'r ConsolidatedRecord, name: &str) -> Option<&'r Value> {
        match self.output.field(name)?.source {
            ColumnSource::Scalar(i) => record.statics.get(i),
            _ => None,
        }
    }
}

fn indices(fields: &[FieldSpec], keep: impl Fn(&FieldRole) -> bool) -> Vec<usize> {
    fields
        .iter()
        .enumerate()
        .filter(|(_, f)| keep(&f.role))
        .map(|(i, _)| i)
        .collect()
}

fn coerce(field: &str, value: Value, kind: FieldKind) -> Result<Value> {
    let shown = value.to_string();
    value.coerce(kind).ok_or_else(|| {
        CollapseError::config(format!("Field {field}: missing value {shown:?} is not a valid {kind}"))
    })
}

fn check_names(source: &SourceSchema) -> Result<()> {
    let reserved = [
        source.id_field.as_str(),
        source.period_field.as_str(),
        source.forward_link.as_str(),
        source.backward_link.as_str(),
        QA_FIELD_COLUMN,
        QA_COUNT_COLUMN,
        ALL_FAIL_COLUMN,
    ];
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for name in reserved {
        if !seen.insert(name) {
            return Err(CollapseError::config(format!("Column name {name} is used twice")));
        }
    }
    if let Some(qa) = &source.qa_field {
        seen.insert(qa.as_str());
    }

    let declared = source
        .fields
        .iter()
        .map(|f| f.name.as_str())
        .chain(source.derived.iter().map(|d| d.name.as_str()));
    for name in declared {
        if name.is_empty() {
            return Err(CollapseError::config("Field names must not be empty"));
        }
        if !seen.insert(name) {
            return Err(CollapseError::config(format!(
                "Field name {name} is declared twice or collides with a reserved column"
            )));
        }
    }
    Ok(())
}

fn layout(
    source: &SourceSchema,
    monthly: &[usize],
    statics: &[usize],
    derived: &[CompiledDerived],
) -> OutputSchema {
    let column = |name: &str, kind, shape, description: &str, missing: Option<Value>, from| OutputField {
        name: name.to_string(),
        kind,
        shape,
        description: description.to_string(),
        missing,
        source: from,
    };

    let mut fields = vec![
        column(&source.id_field, FieldKind::Str, ColumnShape::Scalar, "Loan ID", None, ColumnSource::EntityId),
        column(
            &source.period_field,
            FieldKind::Date,
            ColumnShape::Sequence,
            "month of data",
            None,
            ColumnSource::Periods,
        ),
    ];

    let description = |name: &str| {
        source
            .derived
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.description.as_str())
            .unwrap_or_default()
    };

    for (i, &f) in monthly.iter().enumerate() {
        let spec = &source.fields[f];
        fields.push(column(
            &spec.name,
            spec.kind,
            ColumnShape::Sequence,
            &spec.description,
            Some(spec.missing.clone()),
            ColumnSource::Monthly(i),
        ));
    }
    for d in derived {
        if let Slot::Monthly(i) = d.slot {
            fields.push(column(
                &d.name,
                d.rule.kind(),
                ColumnShape::Sequence,
                description(&d.name),
                Some(d.rule.missing()),
                ColumnSource::Monthly(i),
            ));
        }
    }
    for (i, &f) in statics.iter().enumerate() {
        let spec = &source.fields[f];
        fields.push(column(
            &spec.name,
            spec.kind,
            ColumnShape::Scalar,
            &spec.description,
            Some(spec.missing.clone()),
            ColumnSource::Scalar(i),
        ));
    }
    for d in derived {
        if let Slot::Scalar(i) = d.slot {
            fields.push(column(
                &d.name,
                d.rule.kind(),
                ColumnShape::Scalar,
                description(&d.name),
                Some(d.rule.missing()),
                ColumnSource::Scalar(i),
            ));
        }
    }

    fields.extend([
        column(
            &source.forward_link,
            FieldKind::Str,
            ColumnShape::Optional,
            "loan refinanced to this loan",
            None,
            ColumnSource::ForwardLink,
        ),
        column(
            &source.backward_link,
            FieldKind::Str,
            ColumnShape::Optional,
            "loan refinanced from this loan",
            None,
            ColumnSource::BackwardLink,
        ),
        column(QA_FIELD_COLUMN, FieldKind::Str, ColumnShape::Sequence, "field name", None, ColumnSource::QaFields),
        column(
            QA_COUNT_COLUMN,
            FieldKind::Int,
            ColumnShape::Sequence,
            "# of observations field failed qa",
            None,
            ColumnSource::QaCounts,
        ),
        column(
            ALL_FAIL_COLUMN,
            FieldKind::Str,
            ColumnShape::Sequence,
            "fields that failed QA every observation",
            None,
            ColumnSource::SystematicFailures,
        ),
    ]);

    OutputSchema::new(fields)
}
