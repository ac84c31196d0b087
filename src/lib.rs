//! Collapse monthly loan performance rows into one record per loan.
//!
//! Monthly fields become ordered sequences, static fields are reduced to one
//! value by a declared policy, validation flags are summarized per field and
//! refinance links are resolved. Loans are split into shards that are
//! processed concurrently, each with its own writer.

pub mod aggregate;
pub mod config;
pub mod derive;
pub mod error;
pub mod linkage;
pub mod model;
pub mod partition;
pub mod pipeline;
pub mod qa;
pub mod schema;
pub mod store;
pub mod utils;

// Core types
pub use config::CollapseConfig;
pub use error::{CollapseError, Result};
pub use model::{ConsolidatedRecord, FieldKind, RawObservation, Validity, Value};

// Declarations and the compiled plan
pub use aggregate::{AggregationPolicy, aggregate};
pub use derive::{DerivedRule, DerivedSpec};
pub use qa::{QaMode, QaSummary, QaTracker};
pub use schema::{CollapsePlan, FieldSpec, OutputSchema, SourceSchema, loan_schema};

// Running
pub use linkage::{Linkage, LinkageLookup, LinkageMap, NoLinkage};
pub use partition::{RowIndex, Shard, ShardFilter, partition};
pub use pipeline::{Pipeline, PipelineState, RunReport, ShardReport, collapse_entity};

// Stores
pub use store::{
    MemorySource, MemoryTarget, ParquetSource, ParquetTarget, RecordWriter, SourceStore, TargetStore,
};
