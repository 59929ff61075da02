use serde::Serialize;

use dataloom_core::{
    Catalog, ColumnSpec, IdentityGeneration, NamespaceNames, NamespaceRole, QualifiedName,
    SemanticType, TableSpec, quote_ident, quote_literal,
};
use dataloom_introspect::CatalogObject;

/// Table in the ingest namespace recording committed idempotency keys.
pub const LEDGER_TABLE: &str = "load_ledger";
/// Trigger function keeping `updated_at` current.
pub const TIMESTAMP_FUNCTION: &str = "set_updated_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Definition phases in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Environment,
    Namespaces,
    Tables,
    Constraints,
    ForeignKeys,
    Indexes,
    Comments,
    Triggers,
}

impl Phase {
    pub fn is_post_load(self) -> bool {
        self >= Phase::ForeignKeys
    }
}

/// What a statement creates, in a form destinations can interpret without SQL.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaChange {
    /// Privilege-gated database setting or extension.
    Environment { name: String },
    Namespace { name: String },
    Table {
        table: QualifiedName,
        #[serde(skip)]
        spec: Box<TableSpec>,
    },
    Constraint { object: CatalogObject },
    ForeignKey {
        object: CatalogObject,
        column: String,
        parent: QualifiedName,
        parent_column: String,
    },
    Index { object: CatalogObject },
    Comment { table: QualifiedName },
    Function { object: CatalogObject },
    Trigger { object: CatalogObject },
}

/// One idempotent definition statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DdlStatement {
    pub phase: Phase,
    pub change: SchemaChange,
    pub sql: String,
    /// Insufficient privilege degrades to a warning.
    pub optional: bool,
}

impl DdlStatement {
    fn new(phase: Phase, change: SchemaChange, sql: String) -> Self {
        Self {
            phase,
            change,
            sql,
            optional: false,
        }
    }

    /// Object whose presence turns this statement into a no-op.
    pub fn guard(&self) -> Option<&CatalogObject> {
        match &self.change {
            SchemaChange::Constraint { object }
            | SchemaChange::ForeignKey { object, .. }
            | SchemaChange::Index { object }
            | SchemaChange::Function { object }
            | SchemaChange::Trigger { object } => Some(object),
            _ => None,
        }
    }

    /// Short label used in logs and error messages.
    pub fn label(&self) -> String {
        match &self.change {
            SchemaChange::Environment { name } => format!("environment {name}"),
            SchemaChange::Namespace { name } => format!("namespace {name}"),
            SchemaChange::Table { table, .. } => format!("table {table}"),
            SchemaChange::Comment { table } => format!("comments on {table}"),
            SchemaChange::Constraint { object }
            | SchemaChange::ForeignKey { object, .. }
            | SchemaChange::Index { object }
            | SchemaChange::Function { object }
            | SchemaChange::Trigger { object } => object.to_string(),
        }
    }
}

pub fn ledger_table(names: &NamespaceNames) -> QualifiedName {
    names.qualify(NamespaceRole::Ingest, LEDGER_TABLE)
}

/// Contract of the ingest ledger table.
pub fn ledger_spec() -> TableSpec {
    let column = |name: &str, semantic_type: SemanticType, default: Option<&str>| ColumnSpec {
        name: name.to_string(),
        semantic_type,
        nullable: false,
        default: default.map(str::to_string),
        identity: None,
        comment: None,
    };
    TableSpec {
        namespace: NamespaceRole::Ingest,
        name: LEDGER_TABLE.to_string(),
        source: None,
        comment: Some("Idempotency keys of committed batches".to_string()),
        columns: vec![
            column("idempotency_key", SemanticType::Text, None),
            column("table_name", SemanticType::Text, None),
            column("rows_inserted", SemanticType::BigInt, None),
            column("loaded_at", SemanticType::TimestampTz, Some("now()")),
        ],
        primary_key: Some("idempotency_key".to_string()),
        foreign_keys: Vec::new(),
        checks: Vec::new(),
        enumerations: Vec::new(),
        uniques: Vec::new(),
        indexes: Vec::new(),
        soft_delete_column: "deleted_at".to_string(),
    }
}

/// Optional database-level conveniences: extensions and timezone.
pub fn environment_statements(extensions: &[String], timezone: Option<&str>) -> Vec<DdlStatement> {
    let mut statements: Vec<DdlStatement> = extensions
        .iter()
        .map(|extension| DdlStatement {
            optional: true,
            ..DdlStatement::new(
                Phase::Environment,
                SchemaChange::Environment {
                    name: format!("extension {extension}"),
                },
                format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(extension)),
            )
        })
        .collect();

    if let Some(timezone) = timezone {
        statements.push(DdlStatement {
            optional: true,
            ..DdlStatement::new(
                Phase::Environment,
                SchemaChange::Environment {
                    name: format!("timezone {timezone}"),
                },
                format!(
                    "DO $$ BEGIN EXECUTE format('ALTER DATABASE %I SET timezone TO %L', \
                     current_database(), {}); END $$",
                    quote_literal(timezone)
                ),
            )
        });
    }

    statements
}

/// Namespaces plus the ingest ledger, safe to run against an existing schema.
pub fn ledger_statements(names: &NamespaceNames) -> Vec<DdlStatement> {
    let mut statements = namespace_statements(names);
    statements.push(create_table(&ledger_spec(), names));
    statements
}

/// Namespaces, tables and inline-inexpressible constraints.
pub fn pre_load_statements(catalog: &Catalog, names: &NamespaceNames) -> Vec<DdlStatement> {
    let mut statements = namespace_statements(names);

    for table in &catalog.tables {
        statements.push(create_table(table, names));
    }
    statements.push(create_table(&ledger_spec(), names));

    for table in &catalog.tables {
        statements.extend(constraint_statements(table, names));
    }

    statements
}

/// Foreign keys, indexes, comments and update-timestamp triggers.
pub fn post_load_statements(catalog: &Catalog, names: &NamespaceNames) -> Vec<DdlStatement> {
    let mut statements = Vec::new();

    for table in &catalog.tables {
        statements.extend(foreign_key_statements(table, names));
    }
    for table in &catalog.tables {
        statements.extend(index_statements(table, names));
    }
    for table in &catalog.tables {
        if let Some(statement) = comment_statement(table, names) {
            statements.push(statement);
        }
    }
    statements.extend(trigger_statements(catalog, names));

    statements
}

fn namespace_statements(names: &NamespaceNames) -> Vec<DdlStatement> {
    names
        .all()
        .into_iter()
        .map(|name| {
            let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&name));
            DdlStatement::new(Phase::Namespaces, SchemaChange::Namespace { name }, sql)
        })
        .collect()
}

fn column_definition(table: &TableSpec, column: &ColumnSpec) -> String {
    let mut definition = format!(
        "{} {}",
        quote_ident(&column.name),
        column.semantic_type.sql_type()
    );
    match column.identity {
        Some(identity) => {
            definition.push(' ');
            definition.push_str(identity.sql_clause());
        }
        None => {
            if let Some(default) = &column.default {
                definition.push_str(" DEFAULT ");
                definition.push_str(default);
            }
        }
    }
    let is_pk = table
        .primary_key
        .as_deref()
        .is_some_and(|pk| pk.eq_ignore_ascii_case(&column.name));
    if !column.nullable && !is_pk {
        definition.push_str(" NOT NULL");
    }
    definition
}

fn create_table(table: &TableSpec, names: &NamespaceNames) -> DdlStatement {
    let qualified = table.qualified(names);
    let mut lines: Vec<String> = table
        .columns
        .iter()
        .map(|column| format!("  {}", column_definition(table, column)))
        .collect();
    if let Some(pk) = &table.primary_key {
        lines.push(format!(
            "  CONSTRAINT {} PRIMARY KEY ({})",
            quote_ident(&format!("{}_pkey", table.name)),
            quote_ident(pk)
        ));
    }

    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        qualified.sql(),
        lines.join(",\n")
    );
    DdlStatement::new(
        Phase::Tables,
        SchemaChange::Table {
            table: qualified,
            spec: Box::new(table.clone()),
        },
        sql,
    )
}

fn add_constraint(
    table: &QualifiedName,
    name: &str,
    body: String,
) -> (CatalogObject, String) {
    let object = CatalogObject::Constraint {
        table: table.clone(),
        name: name.to_string(),
    };
    let sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {body}",
        table.sql(),
        quote_ident(name)
    );
    (object, sql)
}

fn constraint_statements(table: &TableSpec, names: &NamespaceNames) -> Vec<DdlStatement> {
    let qualified = table.qualified(names);
    let mut statements = Vec::new();

    for check in &table.checks {
        let (object, sql) = add_constraint(
            &qualified,
            &check.name,
            format!("CHECK ({})", check.expression),
        );
        statements.push(DdlStatement::new(
            Phase::Constraints,
            SchemaChange::Constraint { object },
            sql,
        ));
    }

    for enumeration in &table.enumerations {
        let values: Vec<String> = enumeration
            .values
            .iter()
            .map(|value| quote_literal(value))
            .collect();
        let (object, sql) = add_constraint(
            &qualified,
            &enumeration.name,
            format!(
                "CHECK ({} IN ({}))",
                quote_ident(&enumeration.column),
                values.join(", ")
            ),
        );
        statements.push(DdlStatement::new(
            Phase::Constraints,
            SchemaChange::Constraint { object },
            sql,
        ));
    }

    for unique in &table.uniques {
        let columns: Vec<String> = unique.columns.iter().map(|c| quote_ident(c)).collect();
        let (object, sql) = add_constraint(
            &qualified,
            &unique.name,
            format!("UNIQUE ({})", columns.join(", ")),
        );
        statements.push(DdlStatement::new(
            Phase::Constraints,
            SchemaChange::Constraint { object },
            sql,
        ));
    }

    statements
}

fn foreign_key_statements(table: &TableSpec, names: &NamespaceNames) -> Vec<DdlStatement> {
    let qualified = table.qualified(names);
    table
        .foreign_keys
        .iter()
        .map(|fk| {
            let parent = names.qualify(fk.references.namespace, &fk.references.table);
            let (object, sql) = add_constraint(
                &qualified,
                &table.foreign_key_name(fk),
                format!(
                    "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                    quote_ident(&fk.column),
                    parent.sql(),
                    quote_ident(&fk.references.column),
                    fk.on_delete.sql()
                ),
            );
            DdlStatement::new(
                Phase::ForeignKeys,
                SchemaChange::ForeignKey {
                    object,
                    column: fk.column.clone(),
                    parent,
                    parent_column: fk.references.column.clone(),
                },
                sql,
            )
        })
        .collect()
}

fn index_statements(table: &TableSpec, names: &NamespaceNames) -> Vec<DdlStatement> {
    let qualified = table.qualified(names);
    table
        .indexes
        .iter()
        .map(|index| {
            let columns: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
            let mut sql = format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote_ident(&index.name),
                qualified.sql(),
                columns.join(", ")
            );
            if index.live_only {
                sql.push_str(&format!(
                    " WHERE {} IS NULL",
                    quote_ident(&table.soft_delete_column)
                ));
            }
            DdlStatement::new(
                Phase::Indexes,
                SchemaChange::Index {
                    object: CatalogObject::Index {
                        namespace: qualified.namespace.clone(),
                        name: index.name.clone(),
                    },
                },
                sql,
            )
        })
        .collect()
}

fn comment_statement(table: &TableSpec, names: &NamespaceNames) -> Option<DdlStatement> {
    let qualified = table.qualified(names);
    let mut parts = Vec::new();
    if let Some(comment) = &table.comment {
        parts.push(format!(
            "COMMENT ON TABLE {} IS {}",
            qualified.sql(),
            quote_literal(comment)
        ));
    }
    for column in &table.columns {
        if let Some(comment) = &column.comment {
            parts.push(format!(
                "COMMENT ON COLUMN {}.{} IS {}",
                qualified.sql(),
                quote_ident(&column.name),
                quote_literal(comment)
            ));
        }
    }
    if parts.is_empty() {
        return None;
    }
    let sql = format!(
        "DO $comments$ BEGIN\n  {};\nEND $comments$",
        parts.join(";\n  ")
    );
    Some(DdlStatement::new(
        Phase::Comments,
        SchemaChange::Comment { table: qualified },
        sql,
    ))
}

/// One shared trigger function plus a trigger per table with an `updated_at` column.
fn trigger_statements(catalog: &Catalog, names: &NamespaceNames) -> Vec<DdlStatement> {
    let tables = catalog.tables_with_column(UPDATED_AT_COLUMN);
    if tables.is_empty() {
        return Vec::new();
    }

    let namespace = names.resolve(NamespaceRole::Business).to_string();
    let function_sql = format!(
        "CREATE OR REPLACE FUNCTION {}.{}() RETURNS trigger LANGUAGE plpgsql AS $fn$\n\
         BEGIN\n  NEW.{} := now();\n  RETURN NEW;\nEND\n$fn$",
        quote_ident(&namespace),
        quote_ident(TIMESTAMP_FUNCTION),
        quote_ident(UPDATED_AT_COLUMN)
    );
    let mut statements = vec![DdlStatement::new(
        Phase::Triggers,
        SchemaChange::Function {
            object: CatalogObject::Function {
                namespace: namespace.clone(),
                name: TIMESTAMP_FUNCTION.to_string(),
            },
        },
        function_sql,
    )];

    for table in tables {
        let qualified = table.qualified(names);
        let trigger = format!("{}_{}", table.name, TIMESTAMP_FUNCTION);
        let sql = format!(
            "CREATE TRIGGER {} BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}.{}()",
            quote_ident(&trigger),
            qualified.sql(),
            quote_ident(&namespace),
            quote_ident(TIMESTAMP_FUNCTION)
        );
        statements.push(DdlStatement::new(
            Phase::Triggers,
            SchemaChange::Trigger {
                object: CatalogObject::Trigger {
                    table: qualified,
                    name: trigger,
                },
            },
            sql,
        ));
    }

    statements
}

/// Whether inserts supplying this column need `OVERRIDING SYSTEM VALUE`.
pub fn requires_override(column: &ColumnSpec) -> bool {
    column.identity == Some(IdentityGeneration::Always)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataloom_core::{EnumerationSpec, ForeignKeyRef, IndexSpec, OnDelete, TableRef};

    fn column(name: &str, semantic_type: SemanticType, nullable: bool) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            semantic_type,
            nullable,
            default: None,
            identity: None,
            comment: None,
        }
    }

    fn orders() -> TableSpec {
        let mut id = column("id", SemanticType::BigInt, false);
        id.identity = Some(IdentityGeneration::Always);
        let mut status = column("status", SemanticType::Varchar(16), false);
        status.default = Some("'open'".to_string());
        status.comment = Some("Order's lifecycle state".to_string());
        TableSpec {
            namespace: NamespaceRole::Business,
            name: "orders".to_string(),
            source: None,
            comment: None,
            columns: vec![
                id,
                column("customer_id", SemanticType::BigInt, false),
                status,
                column("updated_at", SemanticType::TimestampTz, true),
                column("deleted_at", SemanticType::TimestampTz, true),
            ],
            primary_key: Some("id".to_string()),
            foreign_keys: vec![ForeignKeyRef {
                name: None,
                column: "customer_id".to_string(),
                references: TableRef {
                    namespace: NamespaceRole::Business,
                    table: "customers".to_string(),
                    column: "id".to_string(),
                },
                on_delete: OnDelete::Restrict,
            }],
            checks: Vec::new(),
            enumerations: vec![EnumerationSpec {
                name: "orders_status_check".to_string(),
                column: "status".to_string(),
                values: vec!["open".to_string(), "closed".to_string()],
            }],
            uniques: Vec::new(),
            indexes: vec![IndexSpec {
                name: "orders_customer_live_idx".to_string(),
                columns: vec!["customer_id".to_string()],
                unique: false,
                live_only: true,
            }],
            soft_delete_column: "deleted_at".to_string(),
        }
    }

    fn catalog() -> Catalog {
        Catalog {
            catalog_version: "1".to_string(),
            tables: vec![orders()],
        }
    }

    #[test]
    fn pre_load_phase_creates_namespaces_tables_and_ledger() {
        let statements = pre_load_statements(&catalog(), &NamespaceNames::default());
        let labels: Vec<String> = statements.iter().map(DdlStatement::label).collect();
        assert_eq!(
            labels,
            vec![
                "namespace core",
                "namespace ingest",
                "namespace audit",
                "table core.orders",
                "table ingest.load_ledger",
                "constraint core.orders.orders_status_check",
            ]
        );
        assert!(statements.iter().all(|statement| !statement.phase.is_post_load()));

        let create = &statements[3].sql;
        assert!(create.contains("\"id\" bigint GENERATED ALWAYS AS IDENTITY"));
        assert!(create.contains("\"status\" varchar(16) DEFAULT 'open' NOT NULL"));
        assert!(create.contains("CONSTRAINT \"orders_pkey\" PRIMARY KEY (\"id\")"));
        assert!(statements[5].sql.ends_with("CHECK (\"status\" IN ('open', 'closed'))"));
    }

    #[test]
    fn post_load_phase_is_guarded_and_ordered() {
        let statements = post_load_statements(&catalog(), &NamespaceNames::default());
        let phases: Vec<Phase> = statements.iter().map(|statement| statement.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::ForeignKeys,
                Phase::Indexes,
                Phase::Comments,
                Phase::Triggers,
                Phase::Triggers
            ]
        );
        assert!(statements[0].sql.contains("ON DELETE RESTRICT"));
        assert!(statements[1].sql.ends_with("WHERE \"deleted_at\" IS NULL"));
        assert!(statements[2].sql.contains("'Order''s lifecycle state'"));
        assert_eq!(
            statements[4].guard(),
            Some(&CatalogObject::Trigger {
                table: QualifiedName::new("core", "orders"),
                name: "orders_set_updated_at".to_string(),
            })
        );
    }

    #[test]
    fn environment_steps_are_optional() {
        let statements = environment_statements(&["pgcrypto".to_string()], Some("UTC"));
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|statement| statement.optional));
        assert!(statements[1].sql.contains("'UTC'"));
    }

    #[test]
    fn namespaces_are_configurable() {
        let names = NamespaceNames {
            business: "sales".to_string(),
            ingest: "sales".to_string(),
            audit: "log".to_string(),
        };
        assert_eq!(ledger_table(&names).to_string(), "sales.load_ledger");
        let statements = ledger_statements(&names);
        assert_eq!(statements.len(), 3);
    }
}
