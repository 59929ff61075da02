use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::{AlignedBatch, RowBatch, RowRejection};
use crate::coerce::coerce_value;
use crate::error::{Error, Result};
use crate::schema::{ColumnSpec, NamespaceNames, TableSpec};
use crate::value::Value;

/// How per-row conversion failures are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Any failing row fails the whole table.
    Strict,
    /// Failing rows are rejected individually.
    #[default]
    Lenient,
}

/// Map a batch onto the table's column contract.
///
/// Unknown columns are dropped with a warning. Output columns follow the
/// catalog order and only include columns the batch supplied; absent
/// optional columns are left to the destination defaults.
pub fn align_batch(
    table: &TableSpec,
    names: &NamespaceNames,
    batch: &RowBatch,
    strictness: Strictness,
) -> Result<AlignedBatch> {
    let qualified = table.qualified(names);
    let alignment_error = |message: String| Error::Alignment {
        table: qualified.to_string(),
        message,
    };

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut mapping: Vec<(usize, usize)> = Vec::new();
    let mut dropped_columns = Vec::new();

    for (input_index, raw_name) in batch.columns.iter().enumerate() {
        let normalized = raw_name.trim().to_lowercase();
        if !seen.insert(normalized) {
            return Err(alignment_error(format!(
                "column '{}' appears more than once",
                raw_name.trim()
            )));
        }
        match table.position(raw_name) {
            Some(position) => mapping.push((position, input_index)),
            None => dropped_columns.push(raw_name.trim().to_string()),
        }
    }

    if !dropped_columns.is_empty() {
        warn!(
            event = "align.columns_dropped",
            table = %qualified,
            columns = ?dropped_columns,
            "dropping columns not present in the catalog"
        );
    }

    let present: BTreeSet<usize> = mapping.iter().map(|(position, _)| *position).collect();
    let missing: Vec<&str> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(position, column)| table.is_required(column) && !present.contains(position))
        .map(|(_, column)| column.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(alignment_error(format!(
            "missing required columns: {}",
            missing.join(", ")
        )));
    }

    mapping.sort();
    let targets: Vec<(&ColumnSpec, usize)> = mapping
        .iter()
        .map(|(position, input_index)| (&table.columns[*position], *input_index))
        .collect();

    let mut rows = Vec::with_capacity(batch.rows.len());
    let mut source_rows = Vec::with_capacity(batch.rows.len());
    let mut rejections = Vec::new();

    for (row_index, row) in batch.rows.iter().enumerate() {
        match align_row(table, &targets, row) {
            Ok(aligned) => {
                rows.push(aligned);
                source_rows.push(row_index);
            }
            Err((column, reason)) => {
                if strictness == Strictness::Strict {
                    return Err(alignment_error(format!(
                        "row {row_index}, column {column}: {reason}"
                    )));
                }
                rejections.push(RowRejection {
                    row: row_index,
                    column: Some(column),
                    reason,
                });
            }
        }
    }

    if !rejections.is_empty() {
        warn!(
            event = "align.rows_rejected",
            table = %qualified,
            rejected = rejections.len(),
            "rows failed coercion"
        );
    }

    Ok(AlignedBatch {
        columns: targets
            .iter()
            .map(|(column, _)| column.name.clone())
            .collect(),
        table: qualified,
        rows,
        source_rows,
        rejections,
        dropped_columns,
        idempotency_key: batch.idempotency_key.clone(),
    })
}

fn align_row(
    table: &TableSpec,
    targets: &[(&ColumnSpec, usize)],
    row: &[Value],
) -> std::result::Result<Vec<Value>, (String, String)> {
    let mut aligned = Vec::with_capacity(targets.len());
    for (column, input_index) in targets {
        let raw = row.get(*input_index).unwrap_or(&Value::Null);
        let value =
            coerce_value(column, raw).map_err(|err| (column.name.clone(), err.to_string()))?;

        let value = if value.is_null() && !accepts_null(table, column) {
            if column.default.is_some() || column.identity.is_some() {
                Value::Default
            } else {
                return Err((
                    column.name.clone(),
                    "null value in non-nullable column".to_string(),
                ));
            }
        } else {
            value
        };
        aligned.push(value);
    }
    Ok(aligned)
}

fn accepts_null(table: &TableSpec, column: &ColumnSpec) -> bool {
    let is_pk = table
        .primary_key
        .as_deref()
        .is_some_and(|pk| pk.eq_ignore_ascii_case(&column.name));
    column.nullable && !is_pk
}
