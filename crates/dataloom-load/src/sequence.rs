use tracing::{debug, info, warn};

use dataloom_core::{Catalog, NamespaceNames, QualifiedName};
use dataloom_introspect::DbError;

use crate::destination::Destination;
use crate::model::{SyncResult, SyncStatus};

/// Align every integer primary key generator with the loaded data.
///
/// The generator is positioned so that the next value is `max(pk) + 1`;
/// empty tables are left alone. Failures are reported per table and never
/// abort the remaining tables.
pub async fn synchronize_sequences(
    destination: &dyn Destination,
    catalog: &Catalog,
    names: &NamespaceNames,
) -> Vec<SyncResult> {
    let mut results = Vec::new();

    for spec in &catalog.tables {
        let Some(column) = spec
            .primary_key_column()
            .filter(|column| column.semantic_type.is_integer())
        else {
            continue;
        };
        let table = spec.qualified(names);
        let result = synchronize_one(destination, &table, &column.name).await;
        results.push(result);
    }

    let advanced = results
        .iter()
        .filter(|result| result.status == SyncStatus::Advanced)
        .count();
    info!(event = "sync.completed", tables = results.len(), advanced);
    results
}

async fn synchronize_one(
    destination: &dyn Destination,
    table: &QualifiedName,
    column: &str,
) -> SyncResult {
    let mut result = SyncResult {
        table: table.clone(),
        column: column.to_string(),
        sequence: None,
        status: SyncStatus::NoSequence,
        max_key: None,
        next_value: None,
        error: None,
    };

    let state = match destination.identity_state(table, column).await {
        Ok(Some(state)) => state,
        Ok(None) => {
            debug!(event = "sync.no_sequence", table = %table, column);
            return result;
        }
        Err(err) => return failed(result, err),
    };

    result.sequence = Some(state.sequence.clone());
    result.max_key = state.max_key;
    result.next_value = Some(state.next_value);

    let Some(max_key) = state.max_key else {
        result.status = SyncStatus::Empty;
        return result;
    };
    let target = max_key.saturating_add(1);
    // Keys at or below the start value leave the generator where it is.
    if state.next_value == target || target <= state.start_value {
        result.status = SyncStatus::Unchanged;
        return result;
    }

    match destination.set_identity(&state.sequence, max_key).await {
        Ok(()) => {
            debug!(
                event = "sync.advanced",
                table = %table,
                sequence = %state.sequence,
                next_value = target
            );
            result.status = SyncStatus::Advanced;
            result.next_value = Some(target);
            result
        }
        Err(err) => failed(result, err),
    }
}

fn failed(mut result: SyncResult, err: DbError) -> SyncResult {
    if err.is_insufficient_privilege() {
        warn!(
            event = "sync.denied",
            table = %result.table,
            error = %err,
            "insufficient privilege on identity generator"
        );
        result.status = SyncStatus::Denied;
    } else {
        warn!(
            event = "sync.failed",
            table = %result.table,
            error = %err,
            "identity synchronization failed"
        );
        result.status = SyncStatus::Failed;
    }
    result.error = Some(err.to_string());
    result
}
