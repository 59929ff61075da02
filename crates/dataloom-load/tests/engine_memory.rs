use anyhow::Result;

use dataloom_core::{Catalog, QualifiedName, RowBatch, Strictness, Value, parse_catalog};
use dataloom_introspect::CatalogObject;
use dataloom_load::{
    LoadEngine, LoadError, LoadOptions, LoadStatus, MemoryDestination, ResetMode, ResetStrategy,
    RunOutcome, SyncStatus,
};

const CATALOG: &str = r#"{
  "catalog_version": "1",
  "tables": [
    {
      "name": "orders",
      "columns": [
        {"name": "id", "type": "bigint", "nullable": false},
        {"name": "customer_id", "type": "bigint", "nullable": false},
        {"name": "note", "type": "text"}
      ],
      "primary_key": "id",
      "foreign_keys": [
        {"column": "customer_id", "references": {"table": "customers"}}
      ]
    },
    {
      "name": "customers",
      "comment": "People who place orders",
      "columns": [
        {"name": "id", "type": "bigint", "nullable": false, "identity": "by_default"},
        {"name": "name", "type": "text", "nullable": false},
        {"name": "updated_at", "type": "timestamptz"}
      ],
      "primary_key": "id"
    },
    {
      "name": "categories",
      "columns": [
        {"name": "id", "type": "integer", "nullable": false},
        {"name": "parent_id", "type": "integer"}
      ],
      "primary_key": "id",
      "foreign_keys": [
        {"column": "parent_id", "references": {"table": "categories"}}
      ]
    }
  ]
}"#;

fn catalog() -> Catalog {
    parse_catalog(CATALOG).expect("test catalog is valid")
}

fn core(table: &str) -> QualifiedName {
    QualifiedName::new("core", table)
}

fn batch(table: &str, columns: &[&str], rows: &[&[&str]]) -> RowBatch {
    let mut batch = RowBatch::new(table, columns.iter().map(|c| c.to_string()).collect());
    for row in rows {
        batch
            .push_row(row.iter().map(|cell| Value::from(*cell)).collect())
            .expect("row width matches");
    }
    batch
}

fn customers() -> RowBatch {
    batch("customers", &["id", "name"], &[&["1", "Ada"], &["2", "Grace"]])
}

fn orders(customer_ids: &[&str]) -> RowBatch {
    let rows: Vec<Vec<String>> = customer_ids
        .iter()
        .enumerate()
        .map(|(index, customer)| vec![(100 + index).to_string(), customer.to_string()])
        .collect();
    let rows: Vec<Vec<&str>> = rows
        .iter()
        .map(|row| row.iter().map(String::as_str).collect())
        .collect();
    let rows: Vec<&[&str]> = rows.iter().map(Vec::as_slice).collect();
    batch("orders", &["id", "customer_id"], &rows)
}

fn categories() -> RowBatch {
    batch("categories", &["id", "parent_id"], &[&["1", ""], &["2", "1"]])
}

fn options(reset: ResetMode, strictness: Strictness) -> LoadOptions {
    LoadOptions {
        reset,
        strictness,
        ..LoadOptions::default()
    }
}

#[tokio::test]
async fn parents_load_before_children_and_post_load_objects_follow() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions::default());

    let report = engine
        .run(
            &destination,
            &catalog(),
            vec![orders(&["1", "2", "2"]), customers(), categories()],
        )
        .await?;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.reset.strategy, ResetStrategy::Rebuilt);
    let customers_at = report.plan.position(&core("customers")).expect("planned");
    let orders_at = report.plan.position(&core("orders")).expect("planned");
    assert!(customers_at < orders_at);

    assert_eq!(destination.row_count(&core("customers")), 2);
    assert_eq!(destination.row_count(&core("orders")), 3);
    assert_eq!(destination.row_count(&core("categories")), 2);
    assert_eq!(report.rows_inserted(), 7);

    assert!(destination.has_object(&CatalogObject::Constraint {
        table: core("orders"),
        name: "orders_customer_id_fkey".to_string(),
    }));
    assert!(destination.has_object(&CatalogObject::Trigger {
        table: core("customers"),
        name: "customers_set_updated_at".to_string(),
    }));
    Ok(())
}

#[tokio::test]
async fn missing_parent_is_rejected_per_row_when_lenient() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(options(ResetMode::Rebuild, Strictness::Lenient));

    let report = engine
        .run(&destination, &catalog(), vec![customers(), orders(&["1", "9"])])
        .await?;

    let result = report.table(&core("orders")).expect("orders result");
    assert_eq!(result.status, LoadStatus::Partial);
    assert_eq!(result.rows_attempted, 2);
    assert_eq!(result.rows_inserted, 1);
    assert_eq!(result.rows_rejected, 1);
    assert_eq!(result.rejections[0].row, 1);
    assert_eq!(result.rejections[0].column.as_deref(), Some("customer_id"));
    assert_eq!(report.outcome, RunOutcome::Partial);
    assert_eq!(destination.row_count(&core("orders")), 1);
    Ok(())
}

#[tokio::test]
async fn missing_parent_fails_the_table_when_strict() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(options(ResetMode::Rebuild, Strictness::Strict));

    let report = engine
        .run(&destination, &catalog(), vec![customers(), orders(&["1", "9"])])
        .await?;

    let result = report.table(&core("orders")).expect("orders result");
    assert_eq!(result.status, LoadStatus::Failed);
    assert!(result.error.as_deref().is_some_and(|error| error.contains("core.orders")));
    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(destination.row_count(&core("orders")), 0);
    assert_eq!(destination.row_count(&core("customers")), 2);
    assert!(!destination.has_object(&CatalogObject::Constraint {
        table: core("orders"),
        name: "orders_customer_id_fkey".to_string(),
    }));
    Ok(())
}

#[tokio::test]
async fn required_cycle_fails_before_touching_the_destination() -> Result<()> {
    let cyclic = parse_catalog(
        r#"{
          "catalog_version": "1",
          "tables": [
            {"name": "a", "columns": [{"name": "id", "type": "bigint", "nullable": false},
                                      {"name": "b_id", "type": "bigint", "nullable": false}],
             "primary_key": "id",
             "foreign_keys": [{"column": "b_id", "references": {"table": "b"}}]},
            {"name": "b", "columns": [{"name": "id", "type": "bigint", "nullable": false},
                                      {"name": "a_id", "type": "bigint", "nullable": false}],
             "primary_key": "id",
             "foreign_keys": [{"column": "a_id", "references": {"table": "a"}}]}
          ]
        }"#,
    )?;
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions::default());

    let err = engine
        .run(&destination, &cyclic, vec![batch("a", &["id", "b_id"], &[&["1", "1"]])])
        .await
        .expect_err("cycle must fail planning");

    match err {
        LoadError::Planning(report) => assert_eq!(report.edges.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(destination.executed().is_empty());
    Ok(())
}

#[tokio::test]
async fn truncate_bootstraps_then_truncates_in_place() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(options(ResetMode::Truncate, Strictness::Lenient));

    let first = engine
        .run(&destination, &catalog(), vec![customers(), orders(&["1"])])
        .await?;
    assert_eq!(first.reset.strategy, ResetStrategy::Bootstrapped);

    let second = engine
        .run(&destination, &catalog(), vec![customers(), orders(&["2"])])
        .await?;
    assert_eq!(second.reset.strategy, ResetStrategy::Truncated);
    assert_eq!(second.outcome, RunOutcome::Succeeded);
    assert_eq!(destination.row_count(&core("customers")), 2);
    assert_eq!(destination.row_count(&core("orders")), 1);
    assert!(destination.has_object(&CatalogObject::Constraint {
        table: core("orders"),
        name: "orders_customer_id_fkey".to_string(),
    }));
    Ok(())
}

#[tokio::test]
async fn truncate_with_partial_schema_is_a_precondition_failure() -> Result<()> {
    let partial = parse_catalog(
        r#"{"catalog_version": "1", "tables": [
            {"name": "customers",
             "columns": [
                {"name": "id", "type": "bigint", "nullable": false, "identity": "by_default"},
                {"name": "name", "type": "text", "nullable": false}
             ],
             "primary_key": "id"}
        ]}"#,
    )?;
    let destination = MemoryDestination::new();
    LoadEngine::new(LoadOptions::default())
        .run(&destination, &partial, vec![customers()])
        .await?;

    let err = LoadEngine::new(options(ResetMode::Truncate, Strictness::Lenient))
        .run(&destination, &catalog(), vec![customers()])
        .await
        .expect_err("partial schema");

    match err {
        LoadError::Precondition(message) => {
            assert!(message.contains("core.categories"));
            assert!(message.contains("core.orders"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(destination.row_count(&core("customers")), 2);
    Ok(())
}

#[tokio::test]
async fn resume_skips_batches_already_in_the_ledger() -> Result<()> {
    let destination = MemoryDestination::new();
    let keyed = || {
        vec![
            customers().with_idempotency_key("customers-v1"),
            orders(&["1", "2"]).with_idempotency_key("orders-v1"),
        ]
    };

    let first = LoadEngine::new(LoadOptions::default())
        .run(&destination, &catalog(), keyed())
        .await?;
    assert_eq!(first.outcome, RunOutcome::Succeeded);

    let resume = LoadOptions {
        resume: true,
        ..LoadOptions::default()
    };
    let second = LoadEngine::new(resume)
        .run(&destination, &catalog(), keyed())
        .await?;

    assert_eq!(second.reset.strategy, ResetStrategy::Resumed);
    assert_eq!(
        second.table(&core("customers")).map(|result| result.status),
        Some(LoadStatus::Skipped)
    );
    assert_eq!(
        second.table(&core("orders")).map(|result| result.status),
        Some(LoadStatus::Skipped)
    );
    assert_eq!(destination.row_count(&core("orders")), 2);
    assert_eq!(second.outcome, RunOutcome::Succeeded);
    Ok(())
}

#[tokio::test]
async fn resume_requires_an_existing_schema() -> Result<()> {
    let destination = MemoryDestination::new();
    let resume = LoadOptions {
        resume: true,
        ..LoadOptions::default()
    };
    let err = LoadEngine::new(resume)
        .run(&destination, &catalog(), vec![customers()])
        .await
        .expect_err("nothing to resume");
    assert!(matches!(err, LoadError::Precondition(_)));
    Ok(())
}

#[tokio::test]
async fn identity_generators_follow_loaded_keys_and_resync_is_a_no_op() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions::default());
    let catalog = catalog();

    let report = engine.run(&destination, &catalog, vec![customers()]).await?;
    let customers_sync = report
        .sync
        .iter()
        .find(|result| result.table == core("customers"))
        .expect("customers synchronized");
    assert_eq!(customers_sync.status, SyncStatus::Advanced);
    assert_eq!(customers_sync.next_value, Some(3));
    assert_eq!(destination.next_identity(&core("customers"), "id"), Some(3));

    let orders_sync = report
        .sync
        .iter()
        .find(|result| result.table == core("orders"))
        .expect("orders checked");
    assert_eq!(orders_sync.status, SyncStatus::NoSequence);

    let again = engine.synchronize(&destination, &catalog).await?;
    let customers_again = again
        .iter()
        .find(|result| result.table == core("customers"))
        .expect("customers synchronized");
    assert_eq!(customers_again.status, SyncStatus::Unchanged);
    assert_eq!(destination.next_identity(&core("customers"), "id"), Some(3));
    Ok(())
}

#[tokio::test]
async fn unknown_columns_are_dropped_and_unmatched_batches_reported() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions::default());
    let with_extra = batch(
        "Customers",
        &["name", "nickname", "id"],
        &[&["Ada", "countess", "1"]],
    );
    let stray = batch("ghosts", &["id"], &[&["1"]]);

    let report = engine
        .run(&destination, &catalog(), vec![with_extra, stray])
        .await?;

    let result = report.table(&core("customers")).expect("customers result");
    assert_eq!(result.status, LoadStatus::Loaded);
    assert_eq!(result.dropped_columns, vec!["nickname".to_string()]);
    assert_eq!(report.unmatched_batches, vec!["ghosts".to_string()]);
    assert_eq!(
        report.table(&core("orders")).map(|result| result.status),
        Some(LoadStatus::NotSupplied)
    );

    let names = destination.column_values(&core("customers"), "name");
    assert_eq!(names, vec![Value::Text("Ada".to_string())]);
    Ok(())
}

#[tokio::test]
async fn missing_required_column_fails_alignment_and_stops_the_plan() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions::default());
    let incomplete = batch("orders", &["id", "note"], &[&["100", "no customer"]]);

    let report = engine
        .run(&destination, &catalog(), vec![customers(), incomplete])
        .await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let failure = report.failure.as_deref().unwrap_or_default();
    assert!(failure.contains("missing required columns: customer_id"));
    assert_eq!(destination.row_count(&core("orders")), 0);
    assert!(report.warnings.iter().any(|warning| warning.contains("post-load")));
    Ok(())
}

#[tokio::test]
async fn optional_steps_degrade_on_insufficient_privilege() -> Result<()> {
    let destination = MemoryDestination::new()
        .with_denied_environment()
        .with_denied_sequences();
    let engine = LoadEngine::new(LoadOptions {
        extensions: vec!["pgcrypto".to_string()],
        timezone: Some("UTC".to_string()),
        ..LoadOptions::default()
    });

    let report = engine
        .run(&destination, &catalog(), vec![customers()])
        .await?;

    assert_eq!(report.reset.degraded_steps.len(), 2);
    assert_eq!(destination.row_count(&core("customers")), 2);
    let denied = report
        .sync
        .iter()
        .find(|result| result.table == core("customers"))
        .expect("customers synchronized");
    assert_eq!(denied.status, SyncStatus::Denied);
    assert_eq!(report.outcome, RunOutcome::Partial);
    Ok(())
}

#[tokio::test]
async fn ddl_only_prepares_schema_without_rows() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions {
        ddl_only: true,
        ..LoadOptions::default()
    });

    let report = engine
        .run(&destination, &catalog(), vec![customers()])
        .await?;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert!(report
        .tables
        .values()
        .all(|result| result.status == LoadStatus::NotAttempted));
    assert_eq!(destination.row_count(&core("customers")), 0);
    assert!(destination
        .executed()
        .iter()
        .any(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS \"core\".\"customers\"")));
    Ok(())
}

#[tokio::test]
async fn post_sql_scripts_run_after_the_load() -> Result<()> {
    let path = std::env::temp_dir().join(format!("dataloom-post-{}.sql", std::process::id()));
    std::fs::write(
        &path,
        "\\set ON_ERROR_STOP on\n-- refresh helpers\n\
         create view core.v as select 1;\nselect $$a;b$$;\n",
    )?;

    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions {
        post_sql: vec![path.clone()],
        analyze: true,
        ..LoadOptions::default()
    });
    let report = engine
        .run(&destination, &catalog(), vec![customers()])
        .await?;
    std::fs::remove_file(&path)?;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    let executed = destination.executed();
    assert!(executed.iter().any(|sql| sql == "create view core.v as select 1"));
    assert!(executed.iter().any(|sql| sql == "select $$a;b$$"));
    assert!(report.warnings.iter().any(|warning| warning.contains("meta-command")));
    assert_eq!(destination.analyzed(), vec![core("customers")]);
    Ok(())
}

const CYCLE_CATALOG: &str = r#"{
  "catalog_version": "1",
  "tables": [
    {
      "name": "customers",
      "columns": [
        {"name": "id", "type": "bigint", "nullable": false},
        {"name": "seller_id", "type": "bigint"}
      ],
      "primary_key": "id",
      "foreign_keys": [
        {"column": "seller_id", "references": {"table": "sellers"}}
      ]
    },
    {
      "name": "sellers",
      "columns": [
        {"name": "id", "type": "bigint", "nullable": false},
        {"name": "best_customer_id", "type": "bigint"}
      ],
      "primary_key": "id",
      "foreign_keys": [
        {"column": "best_customer_id", "references": {"table": "customers"}}
      ]
    }
  ]
}"#;

fn cycle_batches(seller_ids: &[&str]) -> Vec<RowBatch> {
    let rows: Vec<Vec<String>> = seller_ids
        .iter()
        .enumerate()
        .map(|(index, seller)| vec![(index + 1).to_string(), seller.to_string()])
        .collect();
    let rows: Vec<Vec<&str>> = rows
        .iter()
        .map(|row| row.iter().map(String::as_str).collect())
        .collect();
    let rows: Vec<&[&str]> = rows.iter().map(Vec::as_slice).collect();
    vec![
        batch("customers", &["id", "seller_id"], &rows),
        batch("sellers", &["id", "best_customer_id"], &[&["10", "1"]]),
    ]
}

#[tokio::test]
async fn optional_cycle_reloads_in_place_after_truncate() -> Result<()> {
    for strictness in [Strictness::Lenient, Strictness::Strict] {
        let destination = MemoryDestination::new();
        let engine = LoadEngine::new(options(ResetMode::Truncate, strictness));
        let catalog = parse_catalog(CYCLE_CATALOG)?;

        let first = engine.run(&destination, &catalog, cycle_batches(&["10"])).await?;
        assert_eq!(first.reset.strategy, ResetStrategy::Bootstrapped);
        assert_eq!(first.outcome, RunOutcome::Succeeded, "{strictness:?}");

        let second = engine.run(&destination, &catalog, cycle_batches(&["10"])).await?;
        assert_eq!(second.reset.strategy, ResetStrategy::Truncated);
        assert_eq!(second.outcome, RunOutcome::Succeeded, "{strictness:?}");
        assert_eq!(second.plan.unhonored_hints.len(), 1);
        assert_eq!(
            destination.column_values(&core("customers"), "seller_id"),
            vec![Value::Int(10)]
        );
        assert_eq!(
            destination.column_values(&core("sellers"), "best_customer_id"),
            vec![Value::Int(1)]
        );
        assert!(second.warnings.iter().all(|warning| !warning.contains("not restored")));
    }
    Ok(())
}

#[tokio::test]
async fn held_back_reference_to_a_missing_parent_is_rejected_per_row() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(options(ResetMode::Truncate, Strictness::Lenient));
    let catalog = parse_catalog(CYCLE_CATALOG)?;
    engine.run(&destination, &catalog, cycle_batches(&["10"])).await?;

    let report = engine.run(&destination, &catalog, cycle_batches(&["10", "99"])).await?;
    assert_eq!(report.outcome, RunOutcome::Partial);
    let customers = report.table(&core("customers")).expect("customers loaded");
    assert_eq!(customers.status, LoadStatus::Partial);
    assert_eq!(customers.rows_inserted, 2);
    assert_eq!(customers.rows_rejected, 1);
    assert_eq!(customers.rejections[0].row, 1);
    assert_eq!(customers.rejections[0].column.as_deref(), Some("seller_id"));
    assert_eq!(
        destination.column_values(&core("customers"), "seller_id"),
        vec![Value::Int(10), Value::Null]
    );
    Ok(())
}

#[tokio::test]
async fn held_back_reference_to_a_missing_parent_fails_when_strict() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(options(ResetMode::Truncate, Strictness::Strict));
    let catalog = parse_catalog(CYCLE_CATALOG)?;
    engine.run(&destination, &catalog, cycle_batches(&["10"])).await?;

    let report = engine.run(&destination, &catalog, cycle_batches(&["10", "99"])).await?;
    assert_eq!(report.outcome, RunOutcome::Failed);
    let failure = report.failure.as_deref().unwrap_or_default();
    assert!(failure.contains("seller_id"), "{failure}");
    Ok(())
}

#[tokio::test]
async fn keys_below_the_generator_start_leave_it_unchanged() -> Result<()> {
    let destination = MemoryDestination::new();
    let engine = LoadEngine::new(LoadOptions::default());
    let rows = batch("customers", &["id", "name"], &[&["0", "Zero"], &["-1", "Minus"]]);

    let report = engine.run(&destination, &catalog(), vec![rows]).await?;
    let customers_sync = report
        .sync
        .iter()
        .find(|result| result.table == core("customers"))
        .expect("customers synchronized");
    assert_eq!(customers_sync.status, SyncStatus::Unchanged);
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(destination.next_identity(&core("customers"), "id"), Some(1));
    Ok(())
}
