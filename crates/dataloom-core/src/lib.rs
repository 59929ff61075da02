//! Core contracts for dataloom.
//!
//! This crate defines the schema catalog, the dependency planner, row values
//! and their coercion, and the row aligner shared by the loader and the CLI.

pub mod align;
pub mod batch;
pub mod coerce;
pub mod constraints;
pub mod document;
pub mod error;
pub mod graph;
pub mod redaction;
pub mod schema;
pub mod types;
pub mod validation;
pub mod value;

pub use align::{Strictness, align_batch};
pub use batch::{AlignedBatch, RowBatch, RowRejection};
pub use coerce::coerce_value;
pub use constraints::{
    CheckSpec, EnumerationSpec, ForeignKeyRef, IndexSpec, OnDelete, TableRef, UniqueSpec,
};
pub use document::{catalog_schema, load_catalog, parse_catalog};
pub use error::{Error, Result};
pub use graph::{CycleReport, DependencyEdge, DependencyGraph, LoadPlan, plan_load_order};
pub use redaction::{RedactedDsn, redact_dsn};
pub use schema::{
    Catalog, ColumnSpec, NamespaceNames, NamespaceRole, QualifiedName, TableSpec, quote_ident,
    quote_literal,
};
pub use types::{IdentityGeneration, SemanticType};
pub use validation::validate_catalog;
pub use value::Value;

/// Current contract version for catalog documents.
pub const CATALOG_VERSION: &str = "1";
