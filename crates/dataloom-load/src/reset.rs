use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use dataloom_core::{Catalog, NamespaceNames, QualifiedName};
use dataloom_introspect::DbError;

use crate::ddl::{
    DdlStatement, environment_statements, ledger_statements, post_load_statements,
    pre_load_statements,
};
use crate::destination::Destination;
use crate::errors::LoadError;
use crate::model::{LoadOptions, ResetMode, ResetStrategy, ResetSummary};

/// Prepares the destination schema before a load and finishes it afterwards.
pub struct ResetManager<'a> {
    destination: &'a dyn Destination,
    catalog: &'a Catalog,
    options: &'a LoadOptions,
}

fn reset_error(step: impl Into<String>) -> impl FnOnce(DbError) -> LoadError {
    let step = step.into();
    move |source| LoadError::Reset { step, source }
}

impl<'a> ResetManager<'a> {
    pub fn new(
        destination: &'a dyn Destination,
        catalog: &'a Catalog,
        options: &'a LoadOptions,
    ) -> Self {
        Self {
            destination,
            catalog,
            options,
        }
    }

    fn names(&self) -> &NamespaceNames {
        &self.options.namespaces
    }

    fn catalog_tables(&self) -> Vec<QualifiedName> {
        self.catalog
            .tables
            .iter()
            .map(|table| table.qualified(self.names()))
            .collect()
    }

    /// Reset the destination according to the configured mode.
    pub async fn prepare(&self) -> Result<ResetSummary, LoadError> {
        let mut degraded = Vec::new();
        let environment =
            environment_statements(&self.options.extensions, self.options.timezone.as_deref());
        self.apply_all(&environment, &mut degraded).await?;

        if self.options.resume {
            return self.resume(degraded).await;
        }

        match self.options.reset {
            ResetMode::Rebuild => {
                self.rebuild(&mut degraded).await?;
                Ok(summary(ResetStrategy::Rebuilt, degraded, 0))
            }
            ResetMode::Truncate => self.truncate(degraded).await,
        }
    }

    async fn existing_catalog_tables(
        &self,
    ) -> Result<(Vec<QualifiedName>, Vec<QualifiedName>), LoadError> {
        let existing: BTreeSet<QualifiedName> = self
            .destination
            .existing_tables(&self.names().all())
            .await
            .map_err(reset_error("list existing tables"))?
            .into_iter()
            .collect();
        Ok(self
            .catalog_tables()
            .into_iter()
            .partition(|table| existing.contains(table)))
    }

    async fn rebuild(&self, degraded: &mut Vec<String>) -> Result<(), LoadError> {
        for namespace in self.names().all() {
            info!(event = "reset.drop_namespace", namespace = %namespace);
            self.destination
                .drop_namespace(&namespace)
                .await
                .map_err(reset_error(format!("drop namespace {namespace}")))?;
        }
        let statements = pre_load_statements(self.catalog, self.names());
        self.apply_all(&statements, degraded).await
    }

    async fn truncate(&self, mut degraded: Vec<String>) -> Result<ResetSummary, LoadError> {
        let (present, missing) = self.existing_catalog_tables().await?;

        if present.is_empty() {
            info!(
                event = "reset.bootstrap",
                tables = missing.len(),
                "no catalog tables exist; bootstrapping"
            );
            self.rebuild(&mut degraded).await?;
            return Ok(summary(ResetStrategy::Bootstrapped, degraded, 0));
        }
        if !missing.is_empty() {
            return Err(LoadError::Precondition(format!(
                "truncate requires every catalog table; missing: {}",
                join(&missing)
            )));
        }
        self.check_columns(&present).await?;

        self.apply_all(&ledger_statements(self.names()), &mut degraded)
            .await?;
        let targets = self
            .destination
            .existing_tables(&self.names().all())
            .await
            .map_err(reset_error("list existing tables"))?;
        self.destination
            .truncate(&targets)
            .await
            .map_err(reset_error("truncate tables"))?;
        info!(event = "reset.truncated", tables = targets.len());

        Ok(summary(ResetStrategy::Truncated, degraded, targets.len()))
    }

    async fn resume(&self, mut degraded: Vec<String>) -> Result<ResetSummary, LoadError> {
        let (present, missing) = self.existing_catalog_tables().await?;
        if !missing.is_empty() {
            return Err(LoadError::Precondition(format!(
                "resume requires an existing schema; missing: {}",
                join(&missing)
            )));
        }
        self.check_columns(&present).await?;
        self.apply_all(&ledger_statements(self.names()), &mut degraded)
            .await?;
        info!(event = "reset.resume", tables = present.len());

        let mut summary = summary(ResetStrategy::Resumed, degraded, 0);
        summary.destination_empty = false;
        Ok(summary)
    }

    /// Every catalog column must exist in the destination table.
    async fn check_columns(&self, tables: &[QualifiedName]) -> Result<(), LoadError> {
        let mut drift = Vec::new();
        for spec in &self.catalog.tables {
            let qualified = spec.qualified(self.names());
            if !tables.contains(&qualified) {
                continue;
            }
            let existing = self
                .destination
                .existing_columns(&qualified)
                .await
                .map_err(reset_error(format!("list columns of {qualified}")))?;
            let missing: Vec<&str> = spec
                .columns
                .iter()
                .filter(|column| {
                    !existing
                        .iter()
                        .any(|found| found.name.eq_ignore_ascii_case(&column.name))
                })
                .map(|column| column.name.as_str())
                .collect();
            if !missing.is_empty() {
                drift.push(format!("{qualified} ({})", missing.join(", ")));
            }
        }
        if drift.is_empty() {
            Ok(())
        } else {
            Err(LoadError::Precondition(format!(
                "destination tables lack catalog columns: {}",
                drift.join("; ")
            )))
        }
    }

    /// Foreign keys, indexes, comments and triggers; returns the degraded steps.
    pub async fn apply_post_load(&self) -> Result<Vec<String>, LoadError> {
        let mut degraded = Vec::new();
        let statements = post_load_statements(self.catalog, self.names());
        info!(event = "reset.post_load", statements = statements.len());
        self.apply_all(&statements, &mut degraded).await?;
        Ok(degraded)
    }

    async fn apply_all(
        &self,
        statements: &[DdlStatement],
        degraded: &mut Vec<String>,
    ) -> Result<(), LoadError> {
        for statement in statements {
            apply_guarded(self.destination, statement, degraded).await?;
        }
        Ok(())
    }
}

/// Apply a statement unless its guard object already exists.
///
/// Insufficient privilege on an optional statement is recorded as degraded.
pub async fn apply_guarded(
    destination: &dyn Destination,
    statement: &DdlStatement,
    degraded: &mut Vec<String>,
) -> Result<(), LoadError> {
    let label = statement.label();
    if let Some(guard) = statement.guard() {
        let exists = destination
            .object_exists(guard)
            .await
            .map_err(reset_error(format!("probe {label}")))?;
        if exists {
            debug!(event = "ddl.skipped", step = %label, "object already exists");
            return Ok(());
        }
    }

    match destination.apply(statement).await {
        Ok(()) => {
            debug!(event = "ddl.applied", phase = ?statement.phase, step = %label);
            Ok(())
        }
        Err(err) if statement.optional && err.is_insufficient_privilege() => {
            warn!(
                event = "ddl.degraded",
                step = %label,
                error = %err,
                "insufficient privilege; continuing without this step"
            );
            degraded.push(label);
            Ok(())
        }
        Err(source) => Err(LoadError::Reset {
            step: label,
            source,
        }),
    }
}

fn summary(
    strategy: ResetStrategy,
    degraded_steps: Vec<String>,
    truncated_tables: usize,
) -> ResetSummary {
    ResetSummary {
        strategy,
        degraded_steps,
        truncated_tables,
        destination_empty: true,
    }
}

fn join(tables: &[QualifiedName]) -> String {
    tables
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
