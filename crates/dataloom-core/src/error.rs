use thiserror::Error;

use crate::graph::CycleReport;

/// Core error type shared across dataloom crates.
#[derive(Debug, Error)]
pub enum Error {
    /// The catalog violates internal invariants.
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
    /// Required foreign keys form at least one cycle.
    #[error("cyclic required dependencies: {0}")]
    Planning(CycleReport),
    /// A batch cannot be aligned to its table at all.
    #[error("alignment failed for {table}: {message}")]
    Alignment { table: String, message: String },
    /// A single value cannot be converted to its column type.
    #[error("cannot coerce {column}: {message}")]
    Coercion { column: String, message: String },
    /// Catch-all error for unexpected failures.
    #[error("other error: {0}")]
    Other(String),
}

/// Convenience alias for results returned by dataloom crates.
pub type Result<T> = std::result::Result<T, Error>;
