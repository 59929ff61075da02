use anyhow::{Context, Result};
use dataloom_core::{IdentityGeneration, QualifiedName};
use dataloom_introspect::{CatalogObject, DbErrorKind, PgCatalog};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::env;

const NAMESPACE: &str = "dataloom_introspect_it";

const FIXTURE: &[&str] = &[
    "drop schema if exists dataloom_introspect_it cascade",
    "create schema dataloom_introspect_it",
    "create table dataloom_introspect_it.parents (
        id bigint generated always as identity primary key,
        code text not null default 'x'
     )",
    "create table dataloom_introspect_it.children (
        id bigserial primary key,
        parent_id bigint not null,
        constraint children_parent_id_fkey foreign key (parent_id)
          references dataloom_introspect_it.parents (id)
     )",
    "create index children_parent_idx on dataloom_introspect_it.children (parent_id)",
    "create table dataloom_introspect_it.load_ledger (idempotency_key text primary key)",
    "insert into dataloom_introspect_it.load_ledger values ('batch-1')",
    "insert into dataloom_introspect_it.parents (code) values ('a'), ('b')",
];

fn database_url() -> Option<String> {
    env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok()
}

async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(url)
        .await
        .context("connecting to Postgres")
}

async fn reset_fixture(pool: &PgPool) -> Result<()> {
    for statement in FIXTURE {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("executing fixture statement: {statement}"))?;
    }
    Ok(())
}

#[tokio::test]
async fn reads_tables_columns_objects_and_sequences() -> Result<()> {
    let Some(url) = database_url() else {
        eprintln!("skipping: set TEST_DATABASE_URL or DATABASE_URL");
        return Ok(());
    };
    let pool = connect(&url).await?;
    reset_fixture(&pool).await?;
    let catalog = PgCatalog::new(pool.clone());

    let tables = catalog.list_tables(&[NAMESPACE.to_string()]).await?;
    let names: Vec<&str> = tables.iter().map(|table| table.table.as_str()).collect();
    assert_eq!(names, vec!["children", "load_ledger", "parents"]);

    let parents = QualifiedName::new(NAMESPACE, "parents");
    let columns = catalog.list_columns(&parents).await?;
    assert_eq!(columns[0].identity, Some(IdentityGeneration::Always));
    assert!(columns[1].has_default);
    assert!(!columns[1].nullable);

    let children = QualifiedName::new(NAMESPACE, "children");
    assert!(
        catalog
            .object_exists(&CatalogObject::Constraint {
                table: children.clone(),
                name: "children_parent_id_fkey".to_string(),
            })
            .await?
    );
    assert!(
        catalog
            .object_exists(&CatalogObject::Index {
                namespace: NAMESPACE.to_string(),
                name: "children_parent_idx".to_string(),
            })
            .await?
    );
    assert!(
        !catalog
            .object_exists(&CatalogObject::Trigger {
                table: children.clone(),
                name: "children_set_updated_at".to_string(),
            })
            .await?
    );

    let sequence = catalog
        .serial_sequence(&parents, "id")
        .await?
        .context("identity column has a sequence")?;
    assert_eq!(catalog.max_key(&parents, "id").await?, Some(2));
    let state = catalog.sequence_state(&sequence).await?;
    assert_eq!(state.next_value(), 3);
    assert_eq!(state.start_value, 1);
    assert_eq!(catalog.max_key(&children, "id").await?, None);

    let ledger = QualifiedName::new(NAMESPACE, "load_ledger");
    assert!(catalog.ledger_contains(&ledger, "batch-1").await?);
    assert!(!catalog.ledger_contains(&ledger, "batch-2").await?);

    sqlx::query("drop schema dataloom_introspect_it cascade")
        .execute(&pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn classifies_undefined_table_errors() -> Result<()> {
    let Some(url) = database_url() else {
        eprintln!("skipping: set TEST_DATABASE_URL or DATABASE_URL");
        return Ok(());
    };
    let catalog = PgCatalog::new(connect(&url).await?);
    let missing = QualifiedName::new("dataloom_missing_ns", "nothing");
    let err = catalog
        .max_key(&missing, "id")
        .await
        .expect_err("table does not exist");
    assert_eq!(err.kind, DbErrorKind::UndefinedObject);
    assert_eq!(err.code.as_deref(), Some("42P01"));
    Ok(())
}
