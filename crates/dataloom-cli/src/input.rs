use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use dataloom_core::{RowBatch, Value};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid csv in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid batch in {path}: {source}")]
    Batch {
        path: PathBuf,
        #[source]
        source: dataloom_core::Error,
    },
}

/// Read every `*.csv` file of `dir` as one batch.
///
/// The file stem is the batch key (`orders.csv`, `audit.change_log.csv`).
/// Empty cells are NULL. Each batch's idempotency key is derived from the
/// table name and the SHA-256 digest of the file.
pub fn read_batches(dir: &Path) -> Result<Vec<RowBatch>, InputError> {
    let io_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| InputError::Io { path, source }
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_error(dir))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|extension| extension.eq_ignore_ascii_case("csv"))
        })
        .collect();
    files.sort();

    let mut batches = Vec::with_capacity(files.len());
    for path in files {
        let Some(table) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let bytes = std::fs::read(&path).map_err(io_error(&path))?;
        let batch = parse_csv(table, &bytes).map_err(|err| match err {
            ParseError::Csv(source) => InputError::Csv {
                path: path.clone(),
                source,
            },
            ParseError::Batch(source) => InputError::Batch {
                path: path.clone(),
                source,
            },
        })?;
        debug!(
            event = "input.file_read",
            path = %path.display(),
            rows = batch.len()
        );
        batches.push(batch);
    }

    info!(event = "input.batches_read", batches = batches.len(), dir = %dir.display());
    Ok(batches)
}

enum ParseError {
    Csv(csv::Error),
    Batch(dataloom_core::Error),
}

/// Batch key for a file's content.
pub fn idempotency_key(table: &str, bytes: &[u8]) -> String {
    format!("{table}:{}", hex::encode(Sha256::digest(bytes)))
}

fn parse_csv(table: &str, bytes: &[u8]) -> Result<RowBatch, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);
    let columns: Vec<String> = reader
        .headers()
        .map_err(ParseError::Csv)?
        .iter()
        .map(str::to_string)
        .collect();

    let mut batch =
        RowBatch::new(table, columns).with_idempotency_key(idempotency_key(table, bytes));
    for record in reader.records() {
        let record = record.map_err(ParseError::Csv)?;
        let row = record
            .iter()
            .map(|cell| {
                if cell.is_empty() {
                    Value::Null
                } else {
                    Value::Text(cell.to_string())
                }
            })
            .collect();
        batch.push_row(row).map_err(ParseError::Batch)?;
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_maps_empty_cells_to_null() {
        let batch = parse_csv("orders", b"id, customer_id ,note\n1,7,\n2,8,\"late, again\"\n")
            .unwrap_or_else(|_| panic!("valid csv"));

        assert_eq!(batch.table, "orders");
        assert_eq!(batch.columns, vec!["id", "customer_id", "note"]);
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[0][2], Value::Null);
        assert_eq!(batch.rows[1][2], Value::Text("late, again".to_string()));
    }

    #[test]
    fn idempotency_key_depends_on_table_and_content() {
        let key = idempotency_key("orders", b"id\n1\n");
        assert!(key.starts_with("orders:"));
        assert_eq!(key.len(), "orders:".len() + 64);
        assert_eq!(key, idempotency_key("orders", b"id\n1\n"));
        assert_ne!(key, idempotency_key("orders", b"id\n2\n"));
        assert_ne!(key, idempotency_key("customers", b"id\n1\n"));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        assert!(matches!(
            parse_csv("orders", b"id,note\n1\n"),
            Err(ParseError::Csv(_))
        ));
    }

    #[test]
    fn reads_csv_files_of_a_directory_in_name_order() {
        let dir = std::env::temp_dir().join(format!("dataloom-input-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        std::fs::write(dir.join("orders.csv"), "id\n1\n").expect("write");
        std::fs::write(dir.join("audit.change_log.csv"), "id\n1\n").expect("write");
        std::fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let batches = read_batches(&dir).expect("read");
        std::fs::remove_dir_all(&dir).expect("cleanup");

        let tables: Vec<&str> = batches.iter().map(|batch| batch.table.as_str()).collect();
        assert_eq!(tables, vec!["audit.change_log", "orders"]);
        assert!(batches.iter().all(|batch| batch.idempotency_key.is_some()));
    }
}
