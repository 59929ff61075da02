use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use dataloom_core::{
    Catalog, DependencyGraph, LoadPlan, QualifiedName, RowBatch, TableSpec, plan_load_order,
    validate_catalog,
};

use crate::destination::Destination;
use crate::errors::LoadError;
use crate::loader::{RestoredReferences, TableLoader};
use crate::model::{LoadOptions, LoadReport, LoadResult, LoadStatus, SyncResult};
use crate::reset::ResetManager;
use crate::script::split_statements;
use crate::sequence::synchronize_sequences;

/// Orchestrates a full load: plan, reset, per-table load, sequence
/// synchronization and the post-load phase.
#[derive(Debug, Clone, Default)]
pub struct LoadEngine {
    options: LoadOptions,
}

impl LoadEngine {
    pub fn new(options: LoadOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Validate the catalog and compute the insertion order.
    pub fn plan(&self, catalog: &Catalog) -> Result<LoadPlan, LoadError> {
        validate_catalog(catalog)?;
        let graph = DependencyGraph::from_catalog(catalog, &self.options.namespaces);
        let plan = plan_load_order(&graph)?;
        info!(
            event = "plan.ready",
            tables = plan.len(),
            unhonored_hints = plan.unhonored_hints.len()
        );
        Ok(plan)
    }

    /// Run the synchronizer on its own, e.g. to retry after a denied run.
    pub async fn synchronize(
        &self,
        destination: &dyn Destination,
        catalog: &Catalog,
    ) -> Result<Vec<SyncResult>, LoadError> {
        validate_catalog(catalog)?;
        Ok(synchronize_sequences(destination, catalog, &self.options.namespaces).await)
    }

    /// Load `batches` into `destination`.
    ///
    /// Catalog, planning, batch matching and reset failures are returned as
    /// errors before any data is written. Once loading starts, failures are
    /// recorded in the report, which is always returned.
    pub async fn run(
        &self,
        destination: &dyn Destination,
        catalog: &Catalog,
        batches: Vec<RowBatch>,
    ) -> Result<LoadReport, LoadError> {
        let started = Instant::now();
        let plan = self.plan(catalog)?;
        let specs: BTreeMap<QualifiedName, &TableSpec> = catalog
            .tables
            .iter()
            .map(|spec| (spec.qualified(&self.options.namespaces), spec))
            .collect();
        let (mut matched, unmatched) = self.match_batches(catalog, batches)?;

        info!(
            event = "run.started",
            engine = destination.engine(),
            reset = ?self.options.reset,
            strictness = ?self.options.strictness,
            resume = self.options.resume,
            tables = plan.len()
        );

        let reset = ResetManager::new(destination, catalog, &self.options);
        let summary = reset.prepare().await?;

        let mut report = LoadReport::new(plan.clone(), summary);
        report.unmatched_batches = unmatched;
        for name in &report.unmatched_batches {
            report
                .warnings
                .push(format!("batch '{name}' matches no catalog table"));
        }
        for hint in &plan.unhonored_hints {
            report
                .warnings
                .push(format!("optional reference {hint} loads before its parent"));
        }
        for step in &report.reset.degraded_steps {
            report.warnings.push(format!("skipped {step}: insufficient privilege"));
        }

        if self.options.ddl_only {
            info!(event = "run.ddl_only", "schema prepared; skipping data load");
            for table in &plan.tables {
                report.tables.insert(
                    table.to_string(),
                    LoadResult::empty(table.clone(), LoadStatus::NotAttempted),
                );
            }
            report.duration_ms = started.elapsed().as_millis() as u64;
            report.finalize();
            return Ok(report);
        }

        let mut loader = TableLoader::new(
            destination,
            catalog,
            &self.options,
            &plan.unhonored_hints,
            report.reset.destination_empty,
        );
        let mut aborted = false;

        for table in &plan.tables {
            let key = table.to_string();
            let Some(spec) = specs.get(table) else {
                continue;
            };
            if aborted {
                report.tables.insert(
                    key,
                    LoadResult::empty(table.clone(), LoadStatus::NotAttempted),
                );
                continue;
            }
            let Some(batch) = matched.remove(table) else {
                report.tables.insert(key, loader.not_supplied(table));
                continue;
            };

            let loaded = match loader.load(spec, &batch).await {
                Ok(result) => {
                    report.tables.insert(key.clone(), result);
                    loader.restore_references(Some(table)).await
                }
                Err(err) => Err(err),
            };
            match loaded {
                Ok(restored) => merge_restored(&mut report, restored),
                Err(err) => {
                    warn!(
                        event = "load.table_failed",
                        table = %table,
                        error = %err,
                        "aborting remaining tables"
                    );
                    let result = report
                        .tables
                        .entry(key)
                        .or_insert_with(|| LoadResult::empty(table.clone(), LoadStatus::Failed));
                    result.status = LoadStatus::Failed;
                    result.rows_attempted = batch.len();
                    result.error = Some(err.to_string());
                    report.failure = Some(err.to_string());
                    aborted = true;
                }
            }
        }

        if !aborted {
            match loader.restore_references(None).await {
                Ok(restored) => merge_restored(&mut report, restored),
                Err(err) => {
                    warn!(event = "load.references_failed", error = %err);
                    report.failure = Some(err.to_string());
                    aborted = true;
                }
            }
        }
        for table in loader.pending_references() {
            report
                .warnings
                .push(format!("held-back references of {table} were not restored"));
        }

        report.sync = synchronize_sequences(destination, catalog, &self.options.namespaces).await;

        if aborted {
            report
                .warnings
                .push("post-load phase skipped after a fatal load failure".to_string());
        } else if let Err(err) = self.finish(destination, &reset, &plan, &mut report).await {
            warn!(event = "run.post_load_failed", error = %err);
            report.failure = Some(err.to_string());
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.finalize();
        info!(
            event = "run.finished",
            outcome = ?report.outcome,
            rows_inserted = report.rows_inserted(),
            duration_ms = report.duration_ms
        );
        Ok(report)
    }

    /// Post-load objects, extra scripts and statistics.
    async fn finish(
        &self,
        destination: &dyn Destination,
        reset: &ResetManager<'_>,
        plan: &LoadPlan,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        let degraded = reset.apply_post_load().await?;
        for step in degraded {
            report.warnings.push(format!("skipped {step}: insufficient privilege"));
        }

        for path in &self.options.post_sql {
            self.run_script(destination, path, report).await?;
        }

        if self.options.analyze {
            for table in &plan.tables {
                let loaded = report
                    .table(table)
                    .is_some_and(|result| result.rows_inserted > 0);
                if loaded {
                    destination.analyze(table).await?;
                }
            }
        }
        Ok(())
    }

    async fn run_script(
        &self,
        destination: &dyn Destination,
        path: &Path,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        let text = std::fs::read_to_string(path)?;
        let script = split_statements(&text);
        for line in &script.skipped_meta_commands {
            warn!(
                event = "script.meta_command_skipped",
                file = %path.display(),
                line,
                "psql meta-command is not SQL; skipped"
            );
            report.warnings.push(format!(
                "{}:{line}: skipped psql meta-command",
                path.display()
            ));
        }
        for statement in &script.statements {
            destination
                .execute(&statement.sql)
                .await
                .map_err(|err| LoadError::Script {
                    file: path.to_path_buf(),
                    line: statement.line,
                    message: err.to_string(),
                })?;
        }
        info!(
            event = "script.executed",
            file = %path.display(),
            statements = script.statements.len()
        );
        Ok(())
    }

    /// Pair each batch with its catalog table.
    ///
    /// A batch matches on the table's source key, its qualified name or its
    /// bare name, case-insensitively. Two batches for one table are an error.
    fn match_batches(
        &self,
        catalog: &Catalog,
        batches: Vec<RowBatch>,
    ) -> Result<(BTreeMap<QualifiedName, RowBatch>, Vec<String>), LoadError> {
        let names = &self.options.namespaces;
        let mut matched: BTreeMap<QualifiedName, RowBatch> = BTreeMap::new();
        let mut unmatched = Vec::new();

        for batch in batches {
            let wanted = batch.table.trim().to_lowercase();
            let by_source = catalog
                .tables
                .iter()
                .find(|spec| spec.source_key().eq_ignore_ascii_case(&wanted));
            let by_qualified = || {
                catalog
                    .tables
                    .iter()
                    .find(|spec| spec.qualified(names).to_string().eq_ignore_ascii_case(&wanted))
            };
            let by_name = || {
                catalog
                    .tables
                    .iter()
                    .find(|spec| spec.name.eq_ignore_ascii_case(&wanted))
            };

            let Some(spec) = by_source.or_else(by_qualified).or_else(by_name) else {
                warn!(
                    event = "run.batch_unmatched",
                    batch = %batch.table,
                    "batch matches no catalog table"
                );
                unmatched.push(batch.table);
                continue;
            };

            let table = spec.qualified(names);
            if matched.contains_key(&table) {
                return Err(LoadError::Precondition(format!(
                    "more than one batch supplied for {table}"
                )));
            }
            matched.insert(table, batch);
        }

        Ok((matched, unmatched))
    }
}

/// Fold rows whose held-back reference failed into their table's result.
fn merge_restored(report: &mut LoadReport, restored: Vec<RestoredReferences>) {
    for restored in restored {
        if restored.rejections.is_empty() {
            continue;
        }
        let Some(result) = report.tables.get_mut(&restored.table.to_string()) else {
            continue;
        };
        result.rejections.extend(restored.rejections);
        result.rejections.sort_by_key(|rejection| rejection.row);
        result.rows_rejected = result.rejections.len();
        if result.status == LoadStatus::Loaded {
            result.status = LoadStatus::Partial;
        }
        if result.error.is_none() {
            result.error = result.rejections.first().map(|rejection| rejection.reason.clone());
        }
    }
}
