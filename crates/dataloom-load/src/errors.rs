use std::path::PathBuf;

use thiserror::Error;

use dataloom_core::CycleReport;
use dataloom_introspect::DbError;

/// Errors emitted by the load engine.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid catalog: {0}")]
    Catalog(String),
    #[error("cyclic required dependencies: {0}")]
    Planning(CycleReport),
    #[error("reset step '{step}' failed: {source}")]
    Reset {
        step: String,
        #[source]
        source: DbError,
    },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("alignment failed for {table}: {message}")]
    Alignment { table: String, message: String },
    #[error("insertion failed for {table}: {message}")]
    Insertion { table: String, message: String },
    #[error("destination error: {0}")]
    Destination(#[from] DbError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{}:{line}: {message}", file.display())]
    Script {
        file: PathBuf,
        line: usize,
        message: String,
    },
}

impl From<dataloom_core::Error> for LoadError {
    fn from(err: dataloom_core::Error) -> Self {
        match err {
            dataloom_core::Error::Planning(report) => LoadError::Planning(report),
            dataloom_core::Error::Alignment { table, message } => {
                LoadError::Alignment { table, message }
            }
            other => LoadError::Catalog(other.to_string()),
        }
    }
}
