//! Field declarations, plan compilation and the output schema
//!
//! A [`SourceSchema`] declares the source fields. [`CollapsePlan::compile`]
//! validates it and lays out the consolidated record and its
//! [`OutputSchema`].

pub mod catalog;
pub mod field;
pub mod loan;
pub mod plan;

pub use catalog::{CatalogEntry, ColumnShape, ColumnSource, OutputField, OutputSchema};
pub use field::{FieldRole, FieldSpec};
pub use loan::loan_schema;
pub use plan::{CollapsePlan, CompiledDerived, Slot, SourceSchema};
