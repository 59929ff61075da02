use std::collections::{BTreeMap, BTreeSet};

use dataloom_core::{
    AlignedBatch, NamespaceNames, QualifiedName, RowRejection, Strictness, TableSpec, Value,
};

use crate::errors::LoadError;

/// Primary keys inserted during this run, per table.
///
/// Only meaningful when every catalog table started empty. A table whose keys
/// were generated by the destination is marked incomplete and never checked
/// against.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    active: bool,
    keys: BTreeMap<QualifiedName, BTreeSet<String>>,
    incomplete: BTreeSet<QualifiedName>,
}

impl KeyRegistry {
    pub fn new(active: bool) -> Self {
        Self {
            active,
            ..Self::default()
        }
    }

    /// A table that loaded no rows.
    pub fn record_empty(&mut self, table: &QualifiedName) {
        self.keys.entry(table.clone()).or_default();
    }

    /// A table whose contents are unknown to this run.
    pub fn record_unknown(&mut self, table: &QualifiedName) {
        self.incomplete.insert(table.clone());
    }

    /// Remember the primary keys of the rows that were committed.
    pub fn record(&mut self, spec: &TableSpec, batch: &AlignedBatch, committed: &[bool]) {
        let keys = self.keys.entry(batch.table.clone()).or_default();
        let Some(position) = spec.primary_key.as_deref().and_then(|pk| batch.column_index(pk))
        else {
            self.incomplete.insert(batch.table.clone());
            return;
        };
        for (row, _) in batch
            .rows
            .iter()
            .zip(committed)
            .filter(|(_, committed)| **committed)
        {
            match row.get(position) {
                Some(Value::Default) | None => {
                    self.incomplete.insert(batch.table.clone());
                }
                Some(value) => {
                    if let Some(key) = value.render() {
                        keys.insert(key);
                    }
                }
            }
        }
    }

    fn known_keys(&self, table: &QualifiedName) -> Option<&BTreeSet<String>> {
        if self.incomplete.contains(table) {
            return None;
        }
        self.keys.get(table)
    }

    /// Whether `key` was loaded into `table`; `None` when that cannot be known.
    pub fn contains(&self, table: &QualifiedName, key: &str) -> Option<bool> {
        if !self.active {
            return None;
        }
        self.known_keys(table).map(|keys| keys.contains(key))
    }

    /// Find rows whose foreign keys point at parent keys that were never loaded.
    ///
    /// Returns the batch row indexes to drop with their rejections. In strict
    /// mode the first dangling reference is an insertion error.
    pub fn check(
        &self,
        spec: &TableSpec,
        names: &NamespaceNames,
        batch: &AlignedBatch,
        catalog_pk: impl Fn(&QualifiedName) -> Option<String>,
        strictness: Strictness,
    ) -> Result<Vec<(usize, RowRejection)>, LoadError> {
        if !self.active {
            return Ok(Vec::new());
        }

        let own_pk = spec
            .primary_key
            .as_deref()
            .and_then(|pk| batch.column_index(pk));
        let mut checks = Vec::new();
        for fk in &spec.foreign_keys {
            let Some(position) = batch.column_index(&fk.column) else {
                continue;
            };
            let parent = names.qualify(fk.references.namespace, &fk.references.table);
            let references_pk = catalog_pk(&parent)
                .is_some_and(|pk| pk.eq_ignore_ascii_case(&fk.references.column));
            if !references_pk {
                continue;
            }
            let self_reference = spec.references_self(fk);
            let known = if self_reference {
                if own_pk.is_none() {
                    continue;
                }
                None
            } else {
                match self.known_keys(&parent) {
                    Some(keys) => Some(keys),
                    None => continue,
                }
            };
            checks.push((fk, position, parent, known));
        }
        if checks.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut rejected = Vec::new();

        'rows: for (index, row) in batch.rows.iter().enumerate() {
            for (fk, position, parent, known) in &checks {
                let Some(key) = row.get(*position).and_then(Value::render) else {
                    continue;
                };
                let found = match known {
                    Some(keys) => keys.contains(&key),
                    None => seen.contains(&key),
                };
                if found {
                    continue;
                }
                let reason = format!("key ({})=({key}) is not present in {parent}", fk.column);
                if strictness == Strictness::Strict {
                    return Err(LoadError::Insertion {
                        table: batch.table.to_string(),
                        message: format!(
                            "row {}: {reason}",
                            batch.source_rows.get(index).copied().unwrap_or(index)
                        ),
                    });
                }
                rejected.push((
                    index,
                    RowRejection {
                        row: batch.source_rows.get(index).copied().unwrap_or(index),
                        column: Some(fk.column.clone()),
                        reason,
                    },
                ));
                continue 'rows;
            }
            if let Some(key) = own_pk
                .and_then(|position| row.get(position))
                .and_then(Value::render)
            {
                seen.insert(key);
            }
        }

        Ok(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataloom_core::{ColumnSpec, ForeignKeyRef, NamespaceRole, SemanticType, TableRef};

    fn column(name: &str, nullable: bool) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            semantic_type: SemanticType::BigInt,
            nullable,
            default: None,
            identity: None,
            comment: None,
        }
    }

    fn table(name: &str, fks: Vec<(&str, &str)>) -> TableSpec {
        let mut columns = vec![column("id", false)];
        columns.extend(fks.iter().map(|(column_name, _)| column(column_name, true)));
        TableSpec {
            namespace: NamespaceRole::Business,
            name: name.to_string(),
            source: None,
            comment: None,
            columns,
            primary_key: Some("id".to_string()),
            foreign_keys: fks
                .into_iter()
                .map(|(column, parent)| ForeignKeyRef {
                    name: None,
                    column: column.to_string(),
                    references: TableRef {
                        namespace: NamespaceRole::Business,
                        table: parent.to_string(),
                        column: "id".to_string(),
                    },
                    on_delete: Default::default(),
                })
                .collect(),
            checks: Vec::new(),
            enumerations: Vec::new(),
            uniques: Vec::new(),
            indexes: Vec::new(),
            soft_delete_column: "deleted_at".to_string(),
        }
    }

    fn batch(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> AlignedBatch {
        AlignedBatch {
            table: QualifiedName::new("core", table),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            source_rows: (0..rows.len()).collect(),
            rows,
            rejections: Vec::new(),
            dropped_columns: Vec::new(),
            idempotency_key: None,
        }
    }

    fn pk(_: &QualifiedName) -> Option<String> {
        Some("id".to_string())
    }

    #[test]
    fn rejects_children_of_missing_parents() {
        let names = NamespaceNames::default();
        let parent = table("parent", vec![]);
        let child = table("child", vec![("parent_id", "parent")]);

        let mut registry = KeyRegistry::new(true);
        let parents = batch("parent", &["id"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        registry.record(&parent, &parents, &[true, true]);
        let parent_table = QualifiedName::new("core", "parent");
        assert_eq!(registry.contains(&parent_table, "2"), Some(true));
        assert_eq!(registry.contains(&parent_table, "7"), Some(false));
        assert_eq!(registry.contains(&QualifiedName::new("core", "other"), "1"), None);

        let children = batch(
            "child",
            &["id", "parent_id"],
            vec![
                vec![Value::Int(10), Value::Int(1)],
                vec![Value::Int(11), Value::Int(7)],
                vec![Value::Int(12), Value::Null],
            ],
        );
        let rejected = registry
            .check(&child, &names, &children, pk, Strictness::Lenient)
            .expect("lenient check");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, 1);
        assert_eq!(rejected[0].1.column.as_deref(), Some("parent_id"));

        let err = registry
            .check(&child, &names, &children, pk, Strictness::Strict)
            .expect_err("strict check fails");
        assert!(matches!(err, LoadError::Insertion { .. }));
    }

    #[test]
    fn self_references_count_earlier_rows() {
        let names = NamespaceNames::default();
        let node = table("node", vec![("parent_id", "node")]);
        let registry = KeyRegistry::new(true);
        let rows = batch(
            "node",
            &["id", "parent_id"],
            vec![
                vec![Value::Int(1), Value::Null],
                vec![Value::Int(2), Value::Int(1)],
                vec![Value::Int(3), Value::Int(4)],
                vec![Value::Int(4), Value::Int(2)],
            ],
        );
        let rejected = registry
            .check(&node, &names, &rows, pk, Strictness::Lenient)
            .expect("check");
        let indexes: Vec<usize> = rejected.iter().map(|(index, _)| *index).collect();
        assert_eq!(indexes, vec![2]);
    }

    #[test]
    fn generated_or_unknown_parents_are_not_checked() {
        let names = NamespaceNames::default();
        let parent = table("parent", vec![]);
        let child = table("child", vec![("parent_id", "parent")]);
        let children = batch(
            "child",
            &["id", "parent_id"],
            vec![vec![Value::Int(1), Value::Int(99)]],
        );

        let mut registry = KeyRegistry::new(true);
        let generated = batch("parent", &["id"], vec![vec![Value::Default]]);
        registry.record(&parent, &generated, &[true]);
        assert!(registry
            .check(&child, &names, &children, pk, Strictness::Strict)
            .expect("check")
            .is_empty());

        let inactive = KeyRegistry::new(false);
        assert!(inactive
            .check(&child, &names, &children, pk, Strictness::Strict)
            .expect("check")
            .is_empty());
    }
}
