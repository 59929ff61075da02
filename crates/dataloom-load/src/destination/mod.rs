use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;

use dataloom_core::{QualifiedName, RowRejection, Strictness, TableSpec, Value};
use dataloom_introspect::{CatalogObject, DbError, ExistingColumn};

use crate::ddl::DdlStatement;

pub mod memory;
pub mod postgres;

pub use memory::MemoryDestination;
pub use postgres::PostgresDestination;

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Ledger row written in the same transaction as the batch it records.
#[derive(Debug, Clone)]
pub struct LedgerEntry<'a> {
    pub ledger: &'a QualifiedName,
    pub key: &'a str,
}

/// Rows of one table, already aligned and pre-checked.
#[derive(Debug, Clone)]
pub struct InsertRequest<'a> {
    pub table: &'a QualifiedName,
    pub spec: &'a TableSpec,
    /// Catalog column names, in destination order.
    pub columns: &'a [String],
    pub rows: &'a [Vec<Value>],
    /// Input row index of each row, used to report rejections.
    pub source_rows: &'a [usize],
    pub strictness: Strictness,
    pub chunk_size: usize,
    pub ledger: Option<LedgerEntry<'a>>,
}

/// Reference values of rows that were inserted with the column set to NULL.
#[derive(Debug, Clone)]
pub struct ReferenceUpdate<'a> {
    pub table: &'a QualifiedName,
    pub spec: &'a TableSpec,
    /// Primary key column identifying each row.
    pub key_column: &'a str,
    pub column: &'a str,
    /// `(key, value)` per row.
    pub rows: &'a [(Value, Value)],
    pub source_rows: &'a [usize],
    pub strictness: Strictness,
}

/// Rows written by an insert or a reference update, and the rows refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub rejected: Vec<RowRejection>,
}

/// Generator state for an identity-backed key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityState {
    pub sequence: String,
    pub max_key: Option<i64>,
    pub next_value: i64,
    /// First value after a restart; the generator never goes below it.
    pub start_value: i64,
}

/// Target database the engine loads into.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Engine identifier (e.g. `postgres`).
    fn engine(&self) -> &'static str;

    /// Execute a raw statement, e.g. from a post-load script.
    async fn execute(&self, sql: &str) -> DbResult<()>;

    /// Drop a namespace and everything in it, if it exists.
    async fn drop_namespace(&self, namespace: &str) -> DbResult<()>;

    /// Apply one definition statement unconditionally.
    async fn apply(&self, statement: &DdlStatement) -> DbResult<()>;

    async fn object_exists(&self, object: &CatalogObject) -> DbResult<bool>;

    /// Base tables in the given namespaces.
    async fn existing_tables(&self, namespaces: &[String]) -> DbResult<Vec<QualifiedName>>;

    async fn existing_columns(&self, table: &QualifiedName) -> DbResult<Vec<ExistingColumn>>;

    /// Empty the tables, restarting identities and cascading to dependents.
    async fn truncate(&self, tables: &[QualifiedName]) -> DbResult<()>;

    async fn ledger_contains(&self, ledger: &QualifiedName, key: &str) -> DbResult<bool>;

    /// Insert one table's rows in a single transaction.
    ///
    /// Strict requests fail as a whole; lenient requests report row-level
    /// failures as rejections and commit the rest.
    async fn insert_batch(&self, request: &InsertRequest<'_>) -> DbResult<InsertOutcome>;

    /// Set `column` to its value on each keyed row, in one transaction.
    ///
    /// Lenient requests report row-level failures as rejections.
    async fn update_references(&self, request: &ReferenceUpdate<'_>) -> DbResult<InsertOutcome>;

    /// `None` when the column is not backed by a sequence.
    async fn identity_state(
        &self,
        table: &QualifiedName,
        column: &str,
    ) -> DbResult<Option<IdentityState>>;

    /// Position the sequence so the next value is `last_value + 1`.
    async fn set_identity(&self, sequence: &str, last_value: i64) -> DbResult<()>;

    async fn analyze(&self, table: &QualifiedName) -> DbResult<()>;
}

pub(crate) fn rejection(source_rows: &[usize], index: usize, reason: String) -> RowRejection {
    RowRejection {
        row: source_rows.get(index).copied().unwrap_or(index),
        column: None,
        reason,
    }
}

/// Keys of rows refused earlier in a batch.
///
/// A row whose self-referencing foreign key points at one of them is refused
/// too, even when no constraint is installed yet.
pub(crate) struct RejectedKeys {
    key: Option<usize>,
    references: Vec<(usize, String)>,
    accepted: BTreeSet<String>,
    rejected: BTreeSet<String>,
}

impl RejectedKeys {
    pub(crate) fn new(request: &InsertRequest<'_>) -> Self {
        let position = |name: &str| {
            request
                .columns
                .iter()
                .position(|column| column.eq_ignore_ascii_case(name))
        };
        let key = request.spec.primary_key.as_deref().and_then(|pk| position(pk));
        let references = match (key, request.spec.primary_key.as_deref()) {
            (Some(_), Some(pk)) => request
                .spec
                .foreign_keys
                .iter()
                .filter(|fk| {
                    request.spec.references_self(fk)
                        && fk.references.column.eq_ignore_ascii_case(pk)
                })
                .filter_map(|fk| position(&fk.column).map(|at| (at, fk.column.clone())))
                .collect(),
            _ => Vec::new(),
        };
        Self {
            key,
            references,
            accepted: BTreeSet::new(),
            rejected: BTreeSet::new(),
        }
    }

    /// Why `row` cannot be inserted, if it references a refused key.
    pub(crate) fn blocked(&self, row: &[Value]) -> Option<String> {
        if self.rejected.is_empty() {
            return None;
        }
        self.references.iter().find_map(|(position, column)| {
            let key = row.get(*position).and_then(Value::render)?;
            self.rejected
                .contains(&key)
                .then(|| format!("key ({column})=({key}) refers to a row rejected earlier"))
        })
    }

    fn key_of(&self, row: &[Value]) -> Option<String> {
        self.key
            .and_then(|position| row.get(position))
            .and_then(Value::render)
    }

    pub(crate) fn accept(&mut self, row: &[Value]) {
        if let Some(key) = self.key_of(row) {
            self.accepted.insert(key);
        }
    }

    /// A key already accepted in this batch stays referenceable.
    pub(crate) fn reject(&mut self, row: &[Value]) {
        if let Some(key) = self.key_of(row) {
            if !self.accepted.contains(&key) {
                self.rejected.insert(key);
            }
        }
    }
}
