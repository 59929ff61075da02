use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::schema::{Catalog, NamespaceRole, TableSpec};

/// Validate internal consistency of a catalog.
///
/// This checks:
/// - duplicate tables/columns and ambiguous batch keys
/// - primary key, constraint and index columns exist
/// - foreign key columns and referenced targets exist, and targets are keys
/// - identity columns are integers
pub fn validate_catalog(catalog: &Catalog) -> Result<()> {
    let mut tables: BTreeMap<(NamespaceRole, String), &TableSpec> = BTreeMap::new();
    let mut source_keys: BTreeSet<String> = BTreeSet::new();

    for table in &catalog.tables {
        let label = table_label(table);
        if table.name.trim().is_empty() {
            return Err(Error::InvalidCatalog("table with empty name".to_string()));
        }
        if tables
            .insert((table.namespace, table.name.clone()), table)
            .is_some()
        {
            return Err(Error::InvalidCatalog(format!("duplicate table: {label}")));
        }
        if !source_keys.insert(table.source_key().to_lowercase()) {
            return Err(Error::InvalidCatalog(format!(
                "duplicate batch key '{}' ({label})",
                table.source_key()
            )));
        }

        let mut columns = BTreeSet::new();
        for column in &table.columns {
            if !columns.insert(column.name.to_lowercase()) {
                return Err(Error::InvalidCatalog(format!(
                    "duplicate column name: {label}.{}",
                    column.name
                )));
            }
            if column.identity.is_some() && !column.semantic_type.is_integer() {
                return Err(Error::InvalidCatalog(format!(
                    "identity column must be an integer type: {label}.{}",
                    column.name
                )));
            }
        }
    }

    for table in &catalog.tables {
        let label = table_label(table);
        let require_column = |kind: &str, column: &str| -> Result<()> {
            if table.column(column).is_none() {
                return Err(Error::InvalidCatalog(format!(
                    "{kind} column not found: {label}.{column}"
                )));
            }
            Ok(())
        };

        if let Some(pk) = &table.primary_key {
            require_column("primary key", pk)?;
        }

        for fk in &table.foreign_keys {
            require_column("foreign key", &fk.column)?;

            let target = tables
                .get(&(fk.references.namespace, fk.references.table.clone()))
                .ok_or_else(|| {
                    Error::InvalidCatalog(format!(
                        "referenced table not found: {:?}.{} (from {label}.{})",
                        fk.references.namespace, fk.references.table, fk.column
                    ))
                })?;

            if target.column(&fk.references.column).is_none() {
                return Err(Error::InvalidCatalog(format!(
                    "referenced column not found: {}.{} (from {label}.{})",
                    table_label(target),
                    fk.references.column,
                    fk.column
                )));
            }

            if !is_key_column(target, &fk.references.column) {
                return Err(Error::InvalidCatalog(format!(
                    "referenced column is neither primary key nor unique: {}.{}",
                    table_label(target),
                    fk.references.column
                )));
            }
        }

        for enumeration in &table.enumerations {
            require_column("enumeration", &enumeration.column)?;
            if enumeration.values.is_empty() {
                return Err(Error::InvalidCatalog(format!(
                    "enumeration without values: {label}.{}",
                    enumeration.name
                )));
            }
        }

        for unique in &table.uniques {
            for column in &unique.columns {
                require_column("unique", column)?;
            }
        }

        for index in &table.indexes {
            if index.columns.is_empty() {
                return Err(Error::InvalidCatalog(format!(
                    "index without columns: {label}.{}",
                    index.name
                )));
            }
            for column in &index.columns {
                require_column("index", column)?;
            }
            if index.live_only {
                require_column("soft delete", &table.soft_delete_column)?;
            }
        }
    }

    Ok(())
}

fn is_key_column(table: &TableSpec, column: &str) -> bool {
    let is_pk = table
        .primary_key
        .as_deref()
        .is_some_and(|pk| pk.eq_ignore_ascii_case(column));
    let is_unique = table.uniques.iter().any(|unique| {
        unique.columns.len() == 1 && unique.columns[0].eq_ignore_ascii_case(column)
    });
    let is_unique_index = table.indexes.iter().any(|index| {
        index.unique
            && !index.live_only
            && index.columns.len() == 1
            && index.columns[0].eq_ignore_ascii_case(column)
    });
    is_pk || is_unique || is_unique_index
}

fn table_label(table: &TableSpec) -> String {
    let role = match table.namespace {
        NamespaceRole::Business => "business",
        NamespaceRole::Ingest => "ingest",
        NamespaceRole::Audit => "audit",
    };
    format!("{role}.{}", table.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{ForeignKeyRef, IndexSpec, OnDelete, TableRef};
    use crate::schema::ColumnSpec;
    use crate::types::SemanticType;

    fn column(name: &str, semantic_type: SemanticType) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            semantic_type,
            nullable: false,
            default: None,
            identity: None,
            comment: None,
        }
    }

    fn table(name: &str, columns: Vec<ColumnSpec>) -> TableSpec {
        TableSpec {
            namespace: NamespaceRole::Business,
            name: name.to_string(),
            source: None,
            comment: None,
            columns,
            primary_key: Some("id".to_string()),
            foreign_keys: Vec::new(),
            checks: Vec::new(),
            enumerations: Vec::new(),
            uniques: Vec::new(),
            indexes: Vec::new(),
            soft_delete_column: "deleted_at".to_string(),
        }
    }

    fn catalog(tables: Vec<TableSpec>) -> Catalog {
        Catalog {
            catalog_version: "1".to_string(),
            tables,
        }
    }

    #[test]
    fn accepts_consistent_catalog() {
        let parent = table("parent", vec![column("id", SemanticType::BigInt)]);
        let mut child = table(
            "child",
            vec![
                column("id", SemanticType::BigInt),
                column("parent_id", SemanticType::BigInt),
            ],
        );
        child.foreign_keys.push(ForeignKeyRef {
            name: None,
            column: "parent_id".to_string(),
            references: TableRef {
                namespace: NamespaceRole::Business,
                table: "parent".to_string(),
                column: "id".to_string(),
            },
            on_delete: OnDelete::Cascade,
        });

        assert!(validate_catalog(&catalog(vec![parent, child])).is_ok());
    }

    #[test]
    fn rejects_dangling_foreign_key_target() {
        let mut child = table(
            "child",
            vec![
                column("id", SemanticType::BigInt),
                column("parent_id", SemanticType::BigInt),
            ],
        );
        child.foreign_keys.push(ForeignKeyRef {
            name: None,
            column: "parent_id".to_string(),
            references: TableRef {
                namespace: NamespaceRole::Business,
                table: "missing".to_string(),
                column: "id".to_string(),
            },
            on_delete: OnDelete::NoAction,
        });

        let err = validate_catalog(&catalog(vec![child])).unwrap_err();
        assert!(err.to_string().contains("referenced table not found"));
    }

    #[test]
    fn rejects_duplicate_columns_case_insensitively() {
        let t = table(
            "things",
            vec![
                column("id", SemanticType::BigInt),
                column("Name", SemanticType::Text),
                column("name", SemanticType::Text),
            ],
        );
        let err = validate_catalog(&catalog(vec![t])).unwrap_err();
        assert!(err.to_string().contains("duplicate column name"));
    }

    #[test]
    fn rejects_live_only_index_without_soft_delete_column() {
        let mut t = table(
            "things",
            vec![
                column("id", SemanticType::BigInt),
                column("code", SemanticType::Text),
            ],
        );
        t.indexes.push(IndexSpec {
            name: "things_code_live".to_string(),
            columns: vec!["code".to_string()],
            unique: true,
            live_only: true,
        });
        let err = validate_catalog(&catalog(vec![t])).unwrap_err();
        assert!(err.to_string().contains("soft delete column not found"));
    }

    #[test]
    fn rejects_non_integer_identity() {
        let mut id = column("id", SemanticType::Text);
        id.identity = Some(crate::types::IdentityGeneration::ByDefault);
        let err = validate_catalog(&catalog(vec![table("things", vec![id])])).unwrap_err();
        assert!(err.to_string().contains("identity column must be an integer"));
    }
}
