use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{info, warn};

use dataloom_core::{
    AlignedBatch, Catalog, DependencyEdge, NamespaceNames, QualifiedName, RowBatch, RowRejection,
    Strictness, TableSpec, Value, align_batch,
};

use crate::ddl::ledger_table;
use crate::destination::{Destination, InsertRequest, LedgerEntry, ReferenceUpdate};
use crate::errors::LoadError;
use crate::keys::KeyRegistry;
use crate::model::{LoadOptions, LoadResult, LoadStatus};

/// Optional reference values held back until the parent table is loaded.
#[derive(Debug)]
struct DeferredReferences {
    table: QualifiedName,
    key_column: String,
    column: String,
    parent: QualifiedName,
    /// Whether the reference targets the parent's primary key.
    targets_parent_key: bool,
    rows: Vec<(Value, Value)>,
    source_rows: Vec<usize>,
}

/// Rows of a child table whose held-back reference could not be restored.
#[derive(Debug)]
pub struct RestoredReferences {
    pub table: QualifiedName,
    pub restored: usize,
    pub rejections: Vec<RowRejection>,
}

/// Loads one table at a time: ledger check, alignment, referential
/// pre-check and the transactional insert.
///
/// Optional references the plan could not honor are inserted as NULL and
/// written back once their parent table is loaded, so installed foreign keys
/// never see a parent that does not exist yet.
pub struct TableLoader<'a> {
    destination: &'a dyn Destination,
    catalog: &'a Catalog,
    options: &'a LoadOptions,
    ledger: QualifiedName,
    registry: KeyRegistry,
    hints: &'a [DependencyEdge],
    deferred: Vec<DeferredReferences>,
}

impl<'a> TableLoader<'a> {
    pub fn new(
        destination: &'a dyn Destination,
        catalog: &'a Catalog,
        options: &'a LoadOptions,
        hints: &'a [DependencyEdge],
        destination_empty: bool,
    ) -> Self {
        Self {
            destination,
            catalog,
            options,
            ledger: ledger_table(&options.namespaces),
            registry: KeyRegistry::new(destination_empty),
            hints,
            deferred: Vec::new(),
        }
    }

    fn names(&self) -> &NamespaceNames {
        &self.options.namespaces
    }

    /// Record a catalog table that received no batch.
    pub fn not_supplied(&mut self, table: &QualifiedName) -> LoadResult {
        self.registry.record_empty(table);
        LoadResult::empty(table.clone(), LoadStatus::NotSupplied)
    }

    fn spec_of(&self, table: &QualifiedName) -> Option<&'a TableSpec> {
        self.catalog
            .tables
            .iter()
            .find(|spec| &spec.qualified(self.names()) == table)
    }

    fn primary_key_of(&self, table: &QualifiedName) -> Option<String> {
        self.spec_of(table).and_then(|spec| spec.primary_key.clone())
    }

    /// Tables whose held-back references have not been written yet.
    pub fn pending_references(&self) -> Vec<QualifiedName> {
        let tables: BTreeSet<&QualifiedName> =
            self.deferred.iter().map(|deferred| &deferred.table).collect();
        tables.into_iter().cloned().collect()
    }

    /// Load one batch. Errors are fatal for this table and the rest of the plan.
    pub async fn load(
        &mut self,
        spec: &TableSpec,
        batch: &RowBatch,
    ) -> Result<LoadResult, LoadError> {
        let started = Instant::now();
        let table = spec.qualified(self.names());

        if let Some(key) = batch.idempotency_key.as_deref() {
            if self.destination.ledger_contains(&self.ledger, key).await? {
                info!(
                    event = "load.batch_skipped",
                    table = %table,
                    idempotency_key = %key,
                    "batch already recorded in the ledger"
                );
                self.registry.record_unknown(&table);
                let mut result = LoadResult::empty(table, LoadStatus::Skipped);
                result.rows_attempted = batch.len();
                return Ok(result);
            }
        }

        let mut aligned = align_batch(spec, self.names(), batch, self.options.strictness)?;
        let deferred = self.hold_back(spec, &mut aligned);

        let dangling = self.registry.check(
            spec,
            self.names(),
            &aligned,
            |parent| self.primary_key_of(parent),
            self.options.strictness,
        )?;
        if !dangling.is_empty() {
            warn!(
                event = "load.dangling_references",
                table = %table,
                rows = dangling.len(),
                "rows reference parent keys that were not loaded"
            );
            let drop: BTreeSet<usize> = dangling.iter().map(|(index, _)| *index).collect();
            let mut index = 0;
            aligned.rows.retain(|_| {
                let keep = !drop.contains(&index);
                index += 1;
                keep
            });
            let mut index = 0;
            aligned.source_rows.retain(|_| {
                let keep = !drop.contains(&index);
                index += 1;
                keep
            });
            aligned
                .rejections
                .extend(dangling.into_iter().map(|(_, rejection)| rejection));
        }

        let ledger = aligned.idempotency_key.as_deref().map(|key| LedgerEntry {
            ledger: &self.ledger,
            key,
        });
        let request = InsertRequest {
            table: &table,
            spec,
            columns: &aligned.columns,
            rows: &aligned.rows,
            source_rows: &aligned.source_rows,
            strictness: self.options.strictness,
            chunk_size: self.options.chunk_size.max(1),
            ledger,
        };

        let outcome = self
            .destination
            .insert_batch(&request)
            .await
            .map_err(|err| LoadError::Insertion {
                table: table.to_string(),
                message: err.to_string(),
            })?;

        let failed_rows: BTreeSet<usize> = outcome
            .rejected
            .iter()
            .map(|rejection| rejection.row)
            .collect();
        let committed: Vec<bool> = aligned
            .source_rows
            .iter()
            .map(|row| !failed_rows.contains(row))
            .collect();
        self.registry.record(spec, &aligned, &committed);

        let committed_rows: BTreeSet<usize> = aligned
            .source_rows
            .iter()
            .copied()
            .filter(|row| !failed_rows.contains(row))
            .collect();
        for mut held in deferred {
            let kept: Vec<((Value, Value), usize)> = held
                .rows
                .into_iter()
                .zip(held.source_rows)
                .filter(|(_, row)| committed_rows.contains(row))
                .collect();
            if kept.is_empty() {
                continue;
            }
            (held.rows, held.source_rows) = kept.into_iter().unzip();
            self.deferred.push(held);
        }

        let mut rejections = aligned.rejections;
        rejections.extend(outcome.rejected);
        rejections.sort_by_key(|rejection| rejection.row);

        let status = if rejections.is_empty() {
            LoadStatus::Loaded
        } else {
            LoadStatus::Partial
        };

        info!(
            event = "load.table_loaded",
            table = %table,
            attempted = batch.len(),
            inserted = outcome.inserted,
            rejected = rejections.len()
        );

        Ok(LoadResult {
            table,
            status,
            rows_attempted: batch.len(),
            rows_inserted: outcome.inserted,
            rows_rejected: rejections.len(),
            dropped_columns: aligned.dropped_columns,
            error: rejections.first().map(|rejection| rejection.reason.clone()),
            rejections,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Null out references to parents that load after this table.
    fn hold_back(&self, spec: &TableSpec, aligned: &mut AlignedBatch) -> Vec<DeferredReferences> {
        let mut held = Vec::new();
        let hints = self
            .hints
            .iter()
            .filter(|edge| edge.child == aligned.table && !edge.is_self_reference());
        for edge in hints {
            let Some(position) = aligned.column_index(&edge.column) else {
                continue;
            };
            let key = spec
                .primary_key
                .as_deref()
                .and_then(|pk| aligned.column_index(pk).map(|at| (pk, at)));
            let Some((key_column, key_position)) = key else {
                warn!(
                    event = "load.reference_not_deferred",
                    table = %aligned.table,
                    column = %edge.column,
                    "rows carry no primary key; reference inserted as is"
                );
                continue;
            };

            let mut deferred = DeferredReferences {
                table: aligned.table.clone(),
                key_column: key_column.to_string(),
                column: edge.column.clone(),
                parent: edge.parent.clone(),
                targets_parent_key: self.targets_parent_key(spec, edge),
                rows: Vec::new(),
                source_rows: Vec::new(),
            };
            for (row, source_row) in aligned.rows.iter_mut().zip(&aligned.source_rows) {
                let key = match row.get(key_position) {
                    Some(Value::Default) | None => continue,
                    Some(key) => key.clone(),
                };
                let Some(cell) = row.get_mut(position) else {
                    continue;
                };
                if cell.is_null() || matches!(cell, Value::Default) {
                    continue;
                }
                let value = std::mem::replace(cell, Value::Null);
                deferred.rows.push((key, value));
                deferred.source_rows.push(*source_row);
            }
            if !deferred.rows.is_empty() {
                held.push(deferred);
            }
        }
        held
    }

    fn targets_parent_key(&self, spec: &TableSpec, edge: &DependencyEdge) -> bool {
        let referenced = spec
            .foreign_keys
            .iter()
            .find(|fk| fk.column.eq_ignore_ascii_case(&edge.column))
            .map(|fk| fk.references.column.as_str());
        match (referenced, self.primary_key_of(&edge.parent)) {
            (Some(referenced), Some(pk)) => referenced.eq_ignore_ascii_case(&pk),
            _ => false,
        }
    }

    /// Write back held references whose parent is `parent`, or all of them.
    pub async fn restore_references(
        &mut self,
        parent: Option<&QualifiedName>,
    ) -> Result<Vec<RestoredReferences>, LoadError> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|deferred| parent.is_none_or(|parent| &deferred.parent == parent));
        self.deferred = waiting;

        let mut restored = Vec::with_capacity(ready.len());
        for deferred in ready {
            restored.push(self.restore(deferred).await?);
        }
        Ok(restored)
    }

    async fn restore(
        &self,
        deferred: DeferredReferences,
    ) -> Result<RestoredReferences, LoadError> {
        let Some(spec) = self.spec_of(&deferred.table) else {
            return Err(LoadError::Precondition(format!(
                "{} is not part of the catalog",
                deferred.table
            )));
        };

        let mut rejections = Vec::new();
        let mut rows = Vec::with_capacity(deferred.rows.len());
        let mut source_rows = Vec::with_capacity(deferred.rows.len());
        for ((key, value), source_row) in deferred.rows.into_iter().zip(deferred.source_rows) {
            let loaded = if deferred.targets_parent_key {
                value
                    .render()
                    .and_then(|rendered| self.registry.contains(&deferred.parent, &rendered))
            } else {
                None
            };
            if loaded == Some(false) {
                let reason = format!(
                    "key ({})=({}) is not present in {}",
                    deferred.column,
                    value.render().unwrap_or_default(),
                    deferred.parent
                );
                if self.options.strictness == Strictness::Strict {
                    return Err(LoadError::Insertion {
                        table: deferred.table.to_string(),
                        message: format!("row {source_row}: {reason}"),
                    });
                }
                rejections.push(RowRejection {
                    row: source_row,
                    column: Some(deferred.column.clone()),
                    reason,
                });
                continue;
            }
            rows.push((key, value));
            source_rows.push(source_row);
        }

        let request = ReferenceUpdate {
            table: &deferred.table,
            spec,
            key_column: &deferred.key_column,
            column: &deferred.column,
            rows: &rows,
            source_rows: &source_rows,
            strictness: self.options.strictness,
        };
        let outcome = self
            .destination
            .update_references(&request)
            .await
            .map_err(|err| LoadError::Insertion {
                table: deferred.table.to_string(),
                message: err.to_string(),
            })?;
        rejections.extend(outcome.rejected.into_iter().map(|mut rejection| {
            rejection.column = Some(deferred.column.clone());
            rejection
        }));

        info!(
            event = "load.references_restored",
            table = %deferred.table,
            column = %deferred.column,
            parent = %deferred.parent,
            restored = outcome.inserted,
            rejected = rejections.len()
        );
        Ok(RestoredReferences {
            table: deferred.table,
            restored: outcome.inserted,
            rejections,
        })
    }
}
