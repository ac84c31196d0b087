//! Output schema of the consolidated table
//!
//! The schema is the produced interface of a run: the target store creates
//! its table from it, and [`OutputSchema::catalog`] documents it.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

use crate::model::{FieldKind, Value};

/// Metadata key for a column's description
pub const DESCRIPTION_KEY: &str = "description";
/// Metadata key for a column's missing sentinel
pub const MISSING_KEY: &str = "missing";

/// Shape of an output column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnShape {
    /// One value per loan
    Scalar,
    /// One value per period, or one per QA entry
    Sequence,
    /// One value per loan, possibly null
    Optional,
}

/// Where a column's values come from in a [`ConsolidatedRecord`](crate::model::ConsolidatedRecord)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    /// `entity_id`
    EntityId,
    /// `periods`
    Periods,
    /// `monthly[i]`
    Monthly(usize),
    /// `statics[i]`
    Scalar(usize),
    /// `linkage.forward`
    ForwardLink,
    /// `linkage.backward`
    BackwardLink,
    /// Names of fields with failures
    QaFields,
    /// Failure counts, parallel to `QaFields`
    QaCounts,
    /// Names of fields failing every observation
    SystematicFailures,
}

/// One column of the consolidated table
#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    /// Column name
    pub name: String,
    /// Element type
    pub kind: FieldKind,
    /// Scalar, sequence or nullable scalar
    pub shape: ColumnShape,
    /// Human-readable description
    pub description: String,
    /// Missing sentinel, if the column has one
    pub missing: Option<Value>,
    /// Record member holding the values
    pub source: ColumnSource,
}

impl OutputField {
    /// Arrow type of the column
    #[must_use]
    pub fn data_type(&self) -> DataType {
        let element = arrow_type(self.kind);
        match self.shape {
            ColumnShape::Sequence => DataType::List(Arc::new(Field::new("item", element, true))),
            ColumnShape::Scalar | ColumnShape::Optional => element,
        }
    }

    /// Arrow field, with description and sentinel as metadata
    #[must_use]
    pub fn to_arrow_field(&self) -> Field {
        let mut metadata = HashMap::new();
        if !self.description.is_empty() {
            metadata.insert(DESCRIPTION_KEY.to_string(), self.description.clone());
        }
        if let Some(missing) = &self.missing {
            metadata.insert(MISSING_KEY.to_string(), missing.to_string());
        }
        Field::new(&self.name, self.data_type(), self.shape == ColumnShape::Optional).with_metadata(metadata)
    }

    /// Type as shown in the catalog listing
    #[must_use]
    pub fn type_name(&self) -> String {
        match self.shape {
            ColumnShape::Scalar => self.kind.to_string(),
            ColumnShape::Sequence => format!("Array({})", self.kind),
            ColumnShape::Optional => format!("Nullable({})", self.kind),
        }
    }

    /// Description with the sentinel appended
    #[must_use]
    pub fn full_description(&self) -> String {
        match &self.missing {
            Some(missing) if self.description.is_empty() => format!("missing={missing}"),
            Some(missing) => format!("{}, missing={missing}", self.description),
            None => self.description.clone(),
        }
    }
}

/// Arrow type of a field kind
#[must_use]
pub const fn arrow_type(kind: FieldKind) -> DataType {
    match kind {
        FieldKind::Float => DataType::Float32,
        FieldKind::Int => DataType::Int32,
        FieldKind::Str => DataType::Utf8,
        FieldKind::Date => DataType::Date32,
    }
}

/// One row of the serialized field catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Column name
    pub name: String,
    /// Type as shown in the listing
    pub data_type: String,
    /// Description
    pub description: String,
    /// Missing sentinel, rendered
    pub missing: Option<String>,
}

/// Ordered columns of the consolidated table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputSchema {
    fields: Vec<OutputField>,
}

impl OutputSchema {
    /// Wrap columns in order
    #[must_use]
    pub const fn new(fields: Vec<OutputField>) -> Self {
        Self { fields }
    }

    /// Columns in order
    #[must_use]
    pub fn fields(&self) -> &[OutputField] {
        &self.fields
    }

    /// Column by name
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&OutputField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a column
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Number of columns
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True for a schema with no columns
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Arrow schema of the table
    #[must_use]
    pub fn to_arrow_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.fields.iter().map(OutputField::to_arrow_field).collect::<Vec<_>>(),
        ))
    }

    /// Catalog rows, one per column
    #[must_use]
    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.fields
            .iter()
            .map(|f| CatalogEntry {
                name: f.name.clone(),
                data_type: f.type_name(),
                description: f.description.clone(),
                missing: f.missing.as_ref().map(ToString::to_string),
            })
            .collect()
    }

    /// Human-readable listing: name, type and description per line
    #[must_use]
    pub fn catalog(&self) -> String {
        let mut out = String::new();
        for field in &self.fields {
            let line = format!("{:<20} {:<31} {}", field.name, field.type_name(), field.full_description());
            let _ = writeln!(out, "{}", line.trim_end());
        }
        out
    }
}
