//! Read-only queries against the destination's system catalog.
//!
//! Used by guarded DDL, reset preconditions, the ingest ledger and the
//! sequence synchronizer.

pub mod error;
pub mod postgres;

pub use error::{DbError, DbErrorKind, Result};
pub use postgres::{CatalogObject, ExistingColumn, PgCatalog, SequenceState};
