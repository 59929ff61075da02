use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{debug, info};

use dataloom_core::{ColumnSpec, QualifiedName, Strictness, Value, quote_ident};
use dataloom_introspect::{CatalogObject, DbError, DbErrorKind, ExistingColumn, PgCatalog};

use super::{
    DbResult, Destination, IdentityState, InsertOutcome, InsertRequest, ReferenceUpdate,
    RejectedKeys, rejection,
};
use crate::ddl::{DdlStatement, requires_override};

/// PostgreSQL caps bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;
const CHUNK_SAVEPOINT: &str = "dataloom_chunk";
const ROW_SAVEPOINT: &str = "dataloom_row";

/// Destination backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PostgresDestination {
    catalog: PgCatalog,
}

impl PostgresDestination {
    pub fn new(pool: PgPool) -> Self {
        Self {
            catalog: PgCatalog::new(pool),
        }
    }

    pub async fn connect(dsn: &str) -> DbResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(dsn)
            .await?;
        let destination = Self::new(pool);
        let database = destination.catalog.database_name().await?;
        info!(event = "destination.connected", engine = "postgres", database = %database);
        Ok(destination)
    }

    fn pool(&self) -> &PgPool {
        self.catalog.pool()
    }
}

struct InsertShape<'a> {
    head: String,
    columns: Vec<&'a ColumnSpec>,
}

impl<'a> InsertShape<'a> {
    fn new(request: &InsertRequest<'a>) -> DbResult<Self> {
        let columns = request
            .columns
            .iter()
            .map(|name| {
                request.spec.column(name).ok_or_else(|| {
                    DbError::new(
                        DbErrorKind::UndefinedObject,
                        format!("column {name} is not part of {}", request.table),
                    )
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        let quoted: Vec<String> = columns.iter().map(|column| quote_ident(&column.name)).collect();
        let overriding = if columns.iter().any(|column| requires_override(column)) {
            " OVERRIDING SYSTEM VALUE"
        } else {
            ""
        };
        let head = if columns.is_empty() {
            format!("INSERT INTO {}", request.table.sql())
        } else {
            format!(
                "INSERT INTO {} ({}){overriding} ",
                request.table.sql(),
                quoted.join(", ")
            )
        };
        Ok(Self { head, columns })
    }

    fn rows_per_statement(&self, chunk_size: usize) -> usize {
        let width = self.columns.len().max(1);
        chunk_size.clamp(1, MAX_BIND_PARAMS / width)
    }

    async fn execute(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        rows: &[&[Value]],
    ) -> DbResult<()> {
        if self.columns.is_empty() {
            let sql = format!("{} DEFAULT VALUES", self.head);
            for _ in rows {
                sqlx::query(&sql).execute(&mut **tx).await?;
            }
            return Ok(());
        }

        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(&self.head);
        builder.push_values(rows, |mut tuple, row| {
            for (column, value) in self.columns.iter().zip(row.iter()) {
                match value {
                    Value::Default => {
                        tuple.push("DEFAULT");
                    }
                    other => {
                        tuple.push_bind(other.render());
                        tuple
                            .push_unseparated(format!("::{}", column.semantic_type.sql_type()));
                    }
                }
            }
        });
        builder.build().execute(&mut **tx).await?;
        Ok(())
    }
}

async fn savepoint(
    tx: &mut Transaction<'static, Postgres>,
    command: &str,
    name: &str,
) -> DbResult<()> {
    sqlx::query(&format!("{command} {name}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl Destination for PostgresDestination {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn execute(&self, sql: &str) -> DbResult<()> {
        sqlx::raw_sql(sql).execute(self.pool()).await?;
        Ok(())
    }

    async fn drop_namespace(&self, namespace: &str) -> DbResult<()> {
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(namespace));
        sqlx::raw_sql(&sql).execute(self.pool()).await?;
        Ok(())
    }

    async fn apply(&self, statement: &DdlStatement) -> DbResult<()> {
        sqlx::raw_sql(&statement.sql).execute(self.pool()).await?;
        Ok(())
    }

    async fn object_exists(&self, object: &CatalogObject) -> DbResult<bool> {
        self.catalog.object_exists(object).await
    }

    async fn existing_tables(&self, namespaces: &[String]) -> DbResult<Vec<QualifiedName>> {
        self.catalog.list_tables(namespaces).await
    }

    async fn existing_columns(&self, table: &QualifiedName) -> DbResult<Vec<ExistingColumn>> {
        self.catalog.list_columns(table).await
    }

    async fn truncate(&self, tables: &[QualifiedName]) -> DbResult<()> {
        if tables.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = tables.iter().map(QualifiedName::sql).collect();
        let sql = format!(
            "TRUNCATE TABLE {} RESTART IDENTITY CASCADE",
            names.join(", ")
        );
        sqlx::raw_sql(&sql).execute(self.pool()).await?;
        Ok(())
    }

    async fn ledger_contains(&self, ledger: &QualifiedName, key: &str) -> DbResult<bool> {
        self.catalog.ledger_contains(ledger, key).await
    }

    async fn insert_batch(&self, request: &InsertRequest<'_>) -> DbResult<InsertOutcome> {
        let shape = InsertShape::new(request)?;
        let per_statement = shape.rows_per_statement(request.chunk_size);
        let mut tx = self.pool().begin().await?;
        let mut outcome = InsertOutcome::default();

        let mut rejected_keys = RejectedKeys::new(request);

        for (chunk_index, chunk) in request.rows.chunks(per_statement).enumerate() {
            let offset = chunk_index * per_statement;

            if request.strictness == Strictness::Strict {
                let rows: Vec<&[Value]> = chunk.iter().map(Vec::as_slice).collect();
                shape.execute(&mut tx, &rows).await?;
                outcome.inserted += chunk.len();
                continue;
            }

            let mut pending: Vec<usize> = Vec::with_capacity(chunk.len());
            for (position, row) in chunk.iter().enumerate() {
                match rejected_keys.blocked(row) {
                    Some(reason) => {
                        rejected_keys.reject(row);
                        outcome
                            .rejected
                            .push(rejection(request.source_rows, offset + position, reason));
                    }
                    None => pending.push(offset + position),
                }
            }
            if pending.is_empty() {
                continue;
            }
            let rows: Vec<&[Value]> = pending
                .iter()
                .map(|index| request.rows[*index].as_slice())
                .collect();

            savepoint(&mut tx, "SAVEPOINT", CHUNK_SAVEPOINT).await?;
            match shape.execute(&mut tx, &rows).await {
                Ok(()) => {
                    savepoint(&mut tx, "RELEASE SAVEPOINT", CHUNK_SAVEPOINT).await?;
                    rows.iter().for_each(|row| rejected_keys.accept(row));
                    outcome.inserted += rows.len();
                }
                Err(err) if err.kind.is_row_level() => {
                    savepoint(&mut tx, "ROLLBACK TO SAVEPOINT", CHUNK_SAVEPOINT).await?;
                    debug!(
                        event = "load.chunk_retry",
                        table = %request.table,
                        offset,
                        rows = rows.len(),
                        error = %err,
                        "retrying chunk row by row"
                    );
                    for (index, row) in pending.iter().zip(&rows) {
                        if let Some(reason) = rejected_keys.blocked(row) {
                            rejected_keys.reject(row);
                            outcome
                                .rejected
                                .push(rejection(request.source_rows, *index, reason));
                            continue;
                        }
                        savepoint(&mut tx, "SAVEPOINT", ROW_SAVEPOINT).await?;
                        match shape.execute(&mut tx, &[*row]).await {
                            Ok(()) => {
                                savepoint(&mut tx, "RELEASE SAVEPOINT", ROW_SAVEPOINT).await?;
                                rejected_keys.accept(row);
                                outcome.inserted += 1;
                            }
                            Err(err) if err.kind.is_row_level() => {
                                savepoint(&mut tx, "ROLLBACK TO SAVEPOINT", ROW_SAVEPOINT)
                                    .await?;
                                rejected_keys.reject(row);
                                outcome
                                    .rejected
                                    .push(rejection(request.source_rows, *index, err.message));
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(entry) = &request.ledger {
            let sql = format!(
                "INSERT INTO {} (idempotency_key, table_name, rows_inserted) VALUES ($1, $2, $3)",
                entry.ledger.sql()
            );
            sqlx::query(&sql)
                .bind(entry.key)
                .bind(request.table.to_string())
                .bind(outcome.inserted as i64)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(
            event = "load.table_committed",
            table = %request.table,
            inserted = outcome.inserted,
            rejected = outcome.rejected.len()
        );
        Ok(outcome)
    }

    async fn update_references(&self, request: &ReferenceUpdate<'_>) -> DbResult<InsertOutcome> {
        let column_type = |name: &str| {
            request
                .spec
                .column(name)
                .map(|column| column.semantic_type.sql_type())
                .ok_or_else(|| {
                    DbError::new(
                        DbErrorKind::UndefinedObject,
                        format!("column {name} is not part of {}", request.table),
                    )
                })
        };
        let sql = format!(
            "UPDATE {} SET {} = $1::{} WHERE {} = $2::{}",
            request.table.sql(),
            quote_ident(request.column),
            column_type(request.column)?,
            quote_ident(request.key_column),
            column_type(request.key_column)?,
        );

        let mut tx = self.pool().begin().await?;
        let mut outcome = InsertOutcome::default();
        let lenient = request.strictness == Strictness::Lenient;
        for (index, (key, value)) in request.rows.iter().enumerate() {
            if lenient {
                savepoint(&mut tx, "SAVEPOINT", ROW_SAVEPOINT).await?;
            }
            let updated = sqlx::query(&sql)
                .bind(value.render())
                .bind(key.render())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from);
            match updated {
                Ok(done) => {
                    if lenient {
                        savepoint(&mut tx, "RELEASE SAVEPOINT", ROW_SAVEPOINT).await?;
                    }
                    outcome.inserted += done.rows_affected() as usize;
                }
                Err(err) if lenient && err.kind.is_row_level() => {
                    savepoint(&mut tx, "ROLLBACK TO SAVEPOINT", ROW_SAVEPOINT).await?;
                    outcome
                        .rejected
                        .push(rejection(request.source_rows, index, err.message));
                }
                Err(err) => return Err(err),
            }
        }
        tx.commit().await?;
        debug!(
            event = "load.references_updated",
            table = %request.table,
            column = request.column,
            updated = outcome.inserted,
            rejected = outcome.rejected.len()
        );
        Ok(outcome)
    }

    async fn identity_state(
        &self,
        table: &QualifiedName,
        column: &str,
    ) -> DbResult<Option<IdentityState>> {
        let Some(sequence) = self.catalog.serial_sequence(table, column).await? else {
            return Ok(None);
        };
        let max_key = self.catalog.max_key(table, column).await?;
        let state = self.catalog.sequence_state(&sequence).await?;
        Ok(Some(IdentityState {
            sequence,
            max_key,
            next_value: state.next_value(),
            start_value: state.start_value,
        }))
    }

    async fn set_identity(&self, sequence: &str, last_value: i64) -> DbResult<()> {
        sqlx::query("select setval($1::regclass, $2, true)")
            .bind(sequence)
            .bind(last_value)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn analyze(&self, table: &QualifiedName) -> DbResult<()> {
        sqlx::raw_sql(&format!("ANALYZE {}", table.sql()))
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
