use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use dataloom_core::{LoadPlan, NamespaceNames, QualifiedName, RowRejection, Strictness};

/// How the destination is prepared before loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Drop and recreate the owned namespaces.
    #[default]
    Rebuild,
    /// Empty existing tables in place; bootstraps when nothing exists yet.
    Truncate,
}

/// Options for the load engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    pub reset: ResetMode,
    pub strictness: Strictness,
    /// Maximum rows per multi-row insert statement.
    pub chunk_size: usize,
    /// Prepare the schema and stop before loading data.
    pub ddl_only: bool,
    /// Keep existing data and skip batches already recorded in the ledger.
    pub resume: bool,
    pub analyze: bool,
    /// Database timezone to set when privileges allow.
    pub timezone: Option<String>,
    pub extensions: Vec<String>,
    /// Extra SQL scripts executed after the post-load phase.
    pub post_sql: Vec<PathBuf>,
    pub namespaces: NamespaceNames,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            reset: ResetMode::Rebuild,
            strictness: Strictness::Lenient,
            chunk_size: 5000,
            ddl_only: false,
            resume: false,
            analyze: false,
            timezone: None,
            extensions: Vec::new(),
            post_sql: Vec::new(),
            namespaces: NamespaceNames::default(),
        }
    }
}

/// What the reset manager actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStrategy {
    Rebuilt,
    Truncated,
    Bootstrapped,
    Resumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSummary {
    pub strategy: ResetStrategy,
    /// Optional steps skipped for lack of privilege.
    pub degraded_steps: Vec<String>,
    pub truncated_tables: usize,
    /// Whether every catalog table was empty when loading started.
    pub destination_empty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    /// Some rows were rejected; the rest committed.
    Partial,
    Failed,
    /// The batch's idempotency key was already in the ledger.
    Skipped,
    /// No batch was supplied for this table.
    NotSupplied,
    /// An earlier table failed fatally.
    NotAttempted,
}

/// Per-table outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    pub table: QualifiedName,
    pub status: LoadStatus,
    pub rows_attempted: usize,
    pub rows_inserted: usize,
    pub rows_rejected: usize,
    pub dropped_columns: Vec<String>,
    /// First representative error.
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<RowRejection>,
    pub duration_ms: u64,
}

impl LoadResult {
    pub fn empty(table: QualifiedName, status: LoadStatus) -> Self {
        Self {
            table,
            status,
            rows_attempted: 0,
            rows_inserted: 0,
            rows_rejected: 0,
            dropped_columns: Vec::new(),
            error: None,
            rejections: Vec::new(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The generator was moved to max(pk) + 1.
    Advanced,
    /// The generator already pointed at max(pk) + 1.
    Unchanged,
    /// The table has no rows; the generator was left alone.
    Empty,
    /// The key column is not backed by a sequence.
    NoSequence,
    /// Insufficient privilege on the sequence.
    Denied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub table: QualifiedName,
    pub column: String,
    pub sequence: Option<String>,
    pub status: SyncStatus,
    pub max_key: Option<i64>,
    pub next_value: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Partial,
    Failed,
}

/// Full report of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    pub outcome: RunOutcome,
    pub plan: LoadPlan,
    pub reset: ResetSummary,
    pub tables: BTreeMap<String, LoadResult>,
    pub sync: Vec<SyncResult>,
    pub unmatched_batches: Vec<String>,
    pub warnings: Vec<String>,
    /// Fatal failure that stopped the run, if any.
    pub failure: Option<String>,
    pub duration_ms: u64,
}

impl LoadReport {
    pub fn new(plan: LoadPlan, reset: ResetSummary) -> Self {
        Self {
            outcome: RunOutcome::Succeeded,
            plan,
            reset,
            tables: BTreeMap::new(),
            sync: Vec::new(),
            unmatched_batches: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            duration_ms: 0,
        }
    }

    pub fn table(&self, table: &QualifiedName) -> Option<&LoadResult> {
        self.tables.get(&table.to_string())
    }

    pub fn rows_inserted(&self) -> usize {
        self.tables.values().map(|result| result.rows_inserted).sum()
    }

    /// Derive the overall outcome from table and synchronization results.
    pub fn finalize(&mut self) {
        let degraded = self
            .tables
            .values()
            .any(|result| result.status == LoadStatus::Partial)
            || self
                .sync
                .iter()
                .any(|result| matches!(result.status, SyncStatus::Denied | SyncStatus::Failed));

        self.outcome = if self.failure.is_some() {
            RunOutcome::Failed
        } else if degraded {
            RunOutcome::Partial
        } else {
            RunOutcome::Succeeded
        };
    }
}
