use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::QualifiedName;
use crate::value::Value;

/// Tabular input for one logical table, as handed over by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    /// Batch key: table name, `source` alias, or `namespace.table`.
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Lets the same batch be resubmitted without duplicate rows.
    pub idempotency_key: Option<String>,
}

impl RowBatch {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
            idempotency_key: None,
        }
    }

    /// Build a batch from column-name keyed records. Missing cells are NULL.
    pub fn from_records(
        table: impl Into<String>,
        records: Vec<BTreeMap<String, Value>>,
    ) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for name in record.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|name| record.remove(name).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self {
            table: table.into(),
            columns,
            rows,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::Other(format!(
                "row has {} cells but batch '{}' has {} columns",
                row.len(),
                self.table,
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A row the aligner could not convert, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    /// Zero-based index of the row in the input batch.
    pub row: usize,
    pub column: Option<String>,
    pub reason: String,
}

/// Batch reshaped to the destination table's column contract.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedBatch {
    pub table: QualifiedName,
    /// Catalog column names in destination order; absent optional columns are omitted.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Input row index for each aligned row.
    pub source_rows: Vec<usize>,
    pub rejections: Vec<RowRejection>,
    pub dropped_columns: Vec<String>,
    pub idempotency_key: Option<String>,
}

impl AlignedBatch {
    /// Rows present in the input, including rejected ones.
    pub fn rows_attempted(&self) -> usize {
        self.rows.len() + self.rejections.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_records_fills_missing_cells_with_null() {
        let mut first = BTreeMap::new();
        first.insert("id".to_string(), Value::Int(1));
        first.insert("name".to_string(), Value::from("a"));
        let mut second = BTreeMap::new();
        second.insert("id".to_string(), Value::Int(2));

        let batch = RowBatch::from_records("users", vec![first, second]);
        assert_eq!(batch.columns, vec!["id", "name"]);
        assert_eq!(batch.rows[1], vec![Value::Int(2), Value::Null]);
    }

    #[test]
    fn push_row_rejects_ragged_rows() {
        let mut batch = RowBatch::new("users", vec!["id".to_string()]);
        assert!(batch.push_row(vec![Value::Int(1)]).is_ok());
        assert!(batch.push_row(vec![Value::Int(1), Value::Null]).is_err());
        assert_eq!(batch.len(), 1);
    }
}
