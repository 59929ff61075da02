use sqlx::{FromRow, PgPool};

use dataloom_core::{QualifiedName, quote_ident};

use crate::error::Result;

pub async fn fetch_database_name(pool: &PgPool) -> Result<String> {
    let name = sqlx::query_scalar::<_, String>("select current_database()")
        .fetch_one(pool)
        .await?;
    Ok(name)
}

#[derive(Debug, FromRow)]
pub struct RawTable {
    pub namespace: String,
    pub name: String,
}

pub async fn list_base_tables(pool: &PgPool, namespaces: &[String]) -> Result<Vec<RawTable>> {
    let rows = sqlx::query_as::<_, RawTable>(
        r#"
        select n.nspname as namespace, c.relname as name
        from pg_class c
        join pg_namespace n on n.oid = c.relnamespace
        where n.nspname = any($1)
          and c.relkind in ('r', 'p')
          and not c.relispartition
        order by n.nspname, c.relname
        "#,
    )
    .bind(namespaces)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, FromRow)]
pub struct RawColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub has_default: bool,
    pub identity: Option<String>,
}

pub async fn list_columns(pool: &PgPool, namespace: &str, table: &str) -> Result<Vec<RawColumn>> {
    let rows = sqlx::query_as::<_, RawColumn>(
        r#"
        select
          a.attname::text as name,
          pg_catalog.format_type(a.atttypid, a.atttypmod) as data_type,
          (not a.attnotnull) as nullable,
          (ad.adbin is not null) as has_default,
          nullif(a.attidentity::text, '') as identity
        from pg_attribute a
        join pg_class c on c.oid = a.attrelid
        join pg_namespace n on n.oid = c.relnamespace
        left join pg_attrdef ad on ad.adrelid = a.attrelid and ad.adnum = a.attnum
        where n.nspname = $1
          and c.relname = $2
          and a.attnum > 0
          and not a.attisdropped
        order by a.attnum
        "#,
    )
    .bind(namespace)
    .bind(table)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn constraint_exists(
    pool: &PgPool,
    namespace: &str,
    table: &str,
    name: &str,
) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        select exists(
          select 1
          from pg_constraint con
          join pg_class c on c.oid = con.conrelid
          join pg_namespace n on n.oid = c.relnamespace
          where n.nspname = $1 and c.relname = $2 and con.conname = $3
        )
        "#,
    )
    .bind(namespace)
    .bind(table)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

pub async fn index_exists(pool: &PgPool, namespace: &str, name: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        select exists(
          select 1
          from pg_class c
          join pg_namespace n on n.oid = c.relnamespace
          where n.nspname = $1 and c.relname = $2 and c.relkind in ('i', 'I')
        )
        "#,
    )
    .bind(namespace)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

pub async fn trigger_exists(
    pool: &PgPool,
    namespace: &str,
    table: &str,
    name: &str,
) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        select exists(
          select 1
          from pg_trigger t
          join pg_class c on c.oid = t.tgrelid
          join pg_namespace n on n.oid = c.relnamespace
          where n.nspname = $1 and c.relname = $2 and t.tgname = $3 and not t.tgisinternal
        )
        "#,
    )
    .bind(namespace)
    .bind(table)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

pub async fn function_exists(pool: &PgPool, namespace: &str, name: &str) -> Result<bool> {
    let exists = sqlx::query_scalar::<_, bool>(
        r#"
        select exists(
          select 1
          from pg_proc p
          join pg_namespace n on n.oid = p.pronamespace
          where n.nspname = $1 and p.proname = $2
        )
        "#,
    )
    .bind(namespace)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

pub async fn serial_sequence(
    pool: &PgPool,
    table: &QualifiedName,
    column: &str,
) -> Result<Option<String>> {
    let sequence = sqlx::query_scalar::<_, Option<String>>("select pg_get_serial_sequence($1, $2)")
        .bind(table.sql())
        .bind(column)
        .fetch_one(pool)
        .await?;
    Ok(sequence)
}

pub async fn max_key(pool: &PgPool, table: &QualifiedName, column: &str) -> Result<Option<i64>> {
    let sql = format!(
        "select max({})::bigint from {}",
        quote_ident(column),
        table.sql()
    );
    let max = sqlx::query_scalar::<_, Option<i64>>(&sql)
        .fetch_one(pool)
        .await?;
    Ok(max)
}

#[derive(Debug, FromRow)]
pub struct RawSequenceState {
    pub last_value: i64,
    pub is_called: bool,
    pub start_value: i64,
}

/// `sequence` must already be a quoted name as returned by `pg_get_serial_sequence`.
pub async fn sequence_state(pool: &PgPool, sequence: &str) -> Result<RawSequenceState> {
    let sql = format!(
        "select s.last_value, s.is_called, q.seqstart as start_value \
         from {sequence} s, pg_sequence q where q.seqrelid = $1::regclass"
    );
    let state = sqlx::query_as::<_, RawSequenceState>(&sql)
        .bind(sequence)
        .fetch_one(pool)
        .await?;
    Ok(state)
}

pub async fn ledger_contains(pool: &PgPool, ledger: &QualifiedName, key: &str) -> Result<bool> {
    let sql = format!(
        "select exists(select 1 from {} where idempotency_key = $1)",
        ledger.sql()
    );
    let exists = sqlx::query_scalar::<_, bool>(&sql)
        .bind(key)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}
