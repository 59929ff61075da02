use std::fmt;

use serde::Serialize;
use sqlx::PgPool;
use tracing::debug;

use dataloom_core::{IdentityGeneration, QualifiedName};

use crate::error::Result;

mod mapper;
mod queries;

/// Named schema object whose presence makes a DDL statement a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogObject {
    Constraint {
        table: QualifiedName,
        name: String,
    },
    Index {
        namespace: String,
        name: String,
    },
    Trigger {
        table: QualifiedName,
        name: String,
    },
    Function {
        namespace: String,
        name: String,
    },
}

impl fmt::Display for CatalogObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogObject::Constraint { table, name } => write!(f, "constraint {table}.{name}"),
            CatalogObject::Index { namespace, name } => write!(f, "index {namespace}.{name}"),
            CatalogObject::Trigger { table, name } => write!(f, "trigger {table}.{name}"),
            CatalogObject::Function { namespace, name } => {
                write!(f, "function {namespace}.{name}")
            }
        }
    }
}

/// Column as it currently exists in the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExistingColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub has_default: bool,
    pub identity: Option<IdentityGeneration>,
}

/// Current position of an identity generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceState {
    pub last_value: i64,
    pub is_called: bool,
    /// Value handed out first after a restart.
    pub start_value: i64,
}

impl SequenceState {
    /// Value the next `nextval` call will return.
    pub fn next_value(&self) -> i64 {
        if self.is_called {
            self.last_value.saturating_add(1)
        } else {
            self.last_value
        }
    }
}

/// Catalog reader bound to a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn database_name(&self) -> Result<String> {
        queries::fetch_database_name(&self.pool).await
    }

    /// Base tables living in any of the given namespaces, sorted by name.
    pub async fn list_tables(&self, namespaces: &[String]) -> Result<Vec<QualifiedName>> {
        let raw = queries::list_base_tables(&self.pool, namespaces).await?;
        debug!(
            event = "introspect.tables",
            namespaces = ?namespaces,
            count = raw.len()
        );
        Ok(mapper::map_tables(raw))
    }

    pub async fn list_columns(&self, table: &QualifiedName) -> Result<Vec<ExistingColumn>> {
        let raw = queries::list_columns(&self.pool, &table.namespace, &table.table).await?;
        Ok(mapper::map_columns(raw))
    }

    pub async fn object_exists(&self, object: &CatalogObject) -> Result<bool> {
        match object {
            CatalogObject::Constraint { table, name } => {
                queries::constraint_exists(&self.pool, &table.namespace, &table.table, name).await
            }
            CatalogObject::Index { namespace, name } => {
                queries::index_exists(&self.pool, namespace, name).await
            }
            CatalogObject::Trigger { table, name } => {
                queries::trigger_exists(&self.pool, &table.namespace, &table.table, name).await
            }
            CatalogObject::Function { namespace, name } => {
                queries::function_exists(&self.pool, namespace, name).await
            }
        }
    }

    /// Sequence backing an identity or serial column, if any.
    pub async fn serial_sequence(
        &self,
        table: &QualifiedName,
        column: &str,
    ) -> Result<Option<String>> {
        queries::serial_sequence(&self.pool, table, column).await
    }

    pub async fn max_key(&self, table: &QualifiedName, column: &str) -> Result<Option<i64>> {
        queries::max_key(&self.pool, table, column).await
    }

    pub async fn sequence_state(&self, sequence: &str) -> Result<SequenceState> {
        let raw = queries::sequence_state(&self.pool, sequence).await?;
        Ok(SequenceState {
            last_value: raw.last_value,
            is_called: raw.is_called,
            start_value: raw.start_value,
        })
    }

    pub async fn ledger_contains(&self, ledger: &QualifiedName, key: &str) -> Result<bool> {
        queries::ledger_contains(&self.pool, ledger, key).await
    }
}
