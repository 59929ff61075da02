use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use dataloom_core::{QualifiedName, Strictness, TableSpec, Value};
use dataloom_introspect::{CatalogObject, DbError, DbErrorKind, ExistingColumn};

use super::{
    DbResult, Destination, IdentityState, InsertOutcome, InsertRequest, ReferenceUpdate,
    RejectedKeys, rejection,
};
use crate::ddl::{DdlStatement, SchemaChange};

const SEQUENCE_START: i64 = 1;

#[derive(Debug, Clone)]
struct MemorySequence {
    name: String,
    last_value: i64,
    is_called: bool,
}

impl MemorySequence {
    fn new(name: String) -> Self {
        Self {
            name,
            last_value: SEQUENCE_START,
            is_called: false,
        }
    }

    fn next(&mut self) -> i64 {
        if self.is_called {
            self.last_value += 1;
        } else {
            self.is_called = true;
        }
        self.last_value
    }

    fn next_value(&self) -> i64 {
        if self.is_called {
            self.last_value + 1
        } else {
            self.last_value
        }
    }

    fn restart(&mut self) {
        self.last_value = SEQUENCE_START;
        self.is_called = false;
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    spec: TableSpec,
    /// Full-width rows in catalog column order.
    rows: Vec<Vec<Value>>,
    sequences: BTreeMap<String, MemorySequence>,
}

#[derive(Debug, Clone)]
struct MemoryForeignKey {
    table: QualifiedName,
    column: String,
    parent: QualifiedName,
    parent_column: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    namespaces: BTreeSet<String>,
    tables: BTreeMap<QualifiedName, MemoryTable>,
    objects: Vec<CatalogObject>,
    foreign_keys: Vec<MemoryForeignKey>,
    executed: Vec<String>,
    analyzed: Vec<QualifiedName>,
}

/// In-process destination used for dry runs and tests.
///
/// Enforces not-null, primary key and installed foreign key constraints;
/// column defaults other than identities are stored as `Value::Default`.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    state: Mutex<MemoryState>,
    deny_environment: bool,
    deny_sequences: bool,
}

fn error(kind: DbErrorKind, message: impl Into<String>) -> DbError {
    DbError::new(kind, message)
}

fn object_namespace(object: &CatalogObject) -> &str {
    match object {
        CatalogObject::Constraint { table, .. } | CatalogObject::Trigger { table, .. } => {
            &table.namespace
        }
        CatalogObject::Index { namespace, .. } | CatalogObject::Function { namespace, .. } => {
            namespace
        }
    }
}

fn key_of(value: &Value) -> Option<String> {
    value.render()
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject environment steps (extensions, timezone) with insufficient privilege.
    pub fn with_denied_environment(mut self) -> Self {
        self.deny_environment = true;
        self
    }

    /// Reject sequence updates with insufficient privilege.
    pub fn with_denied_sequences(mut self) -> Self {
        self.deny_sequences = true;
        self
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| error(DbErrorKind::Other, "memory destination lock poisoned"))
    }

    /// Full-width rows of a table, in insertion order.
    pub fn rows(&self, table: &QualifiedName) -> Vec<Vec<Value>> {
        self.lock()
            .ok()
            .and_then(|state| state.tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &QualifiedName) -> usize {
        self.rows(table).len()
    }

    /// Values of one column across all rows.
    pub fn column_values(&self, table: &QualifiedName, column: &str) -> Vec<Value> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let Some(memory) = state.tables.get(table) else {
            return Vec::new();
        };
        let Some(position) = memory.spec.position(column) else {
            return Vec::new();
        };
        memory
            .rows
            .iter()
            .filter_map(|row| row.get(position).cloned())
            .collect()
    }

    pub fn has_object(&self, object: &CatalogObject) -> bool {
        self.lock()
            .map(|state| state.objects.contains(object))
            .unwrap_or(false)
    }

    /// SQL of every statement applied or executed, in order.
    pub fn executed(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.executed.clone())
            .unwrap_or_default()
    }

    pub fn analyzed(&self) -> Vec<QualifiedName> {
        self.lock()
            .map(|state| state.analyzed.clone())
            .unwrap_or_default()
    }

    /// Next value the identity generator of `column` would hand out.
    pub fn next_identity(&self, table: &QualifiedName, column: &str) -> Option<i64> {
        let state = self.lock().ok()?;
        let memory = state.tables.get(table)?;
        let name = memory.spec.column(column)?.name.clone();
        memory.sequences.get(&name).map(MemorySequence::next_value)
    }

    fn apply_change(&self, state: &mut MemoryState, statement: &DdlStatement) -> DbResult<()> {
        match &statement.change {
            SchemaChange::Environment { name } => {
                if self.deny_environment {
                    return Err(error(
                        DbErrorKind::InsufficientPrivilege,
                        format!("permission denied for {name}"),
                    ));
                }
            }
            SchemaChange::Namespace { name } => {
                state.namespaces.insert(name.clone());
            }
            SchemaChange::Table { table, spec } => {
                if !state.namespaces.contains(&table.namespace) {
                    return Err(error(
                        DbErrorKind::UndefinedObject,
                        format!("schema \"{}\" does not exist", table.namespace),
                    ));
                }
                if !state.tables.contains_key(table) {
                    let sequences = spec
                        .columns
                        .iter()
                        .filter(|column| column.identity.is_some())
                        .map(|column| {
                            let name = format!(
                                "{}.{}_{}_seq",
                                table.namespace, table.table, column.name
                            );
                            (column.name.clone(), MemorySequence::new(name))
                        })
                        .collect();
                    state.tables.insert(
                        table.clone(),
                        MemoryTable {
                            spec: spec.as_ref().clone(),
                            rows: Vec::new(),
                            sequences,
                        },
                    );
                }
            }
            SchemaChange::Constraint { object } | SchemaChange::Trigger { object } => {
                require_object_table(state, object)?;
                if state.objects.contains(object) {
                    return Err(error(
                        DbErrorKind::DuplicateObject,
                        format!("{object} already exists"),
                    ));
                }
                state.objects.push(object.clone());
            }
            SchemaChange::ForeignKey {
                object,
                column,
                parent,
                parent_column,
            } => {
                require_object_table(state, object)?;
                if state.objects.contains(object) {
                    return Err(error(
                        DbErrorKind::DuplicateObject,
                        format!("{object} already exists"),
                    ));
                }
                let CatalogObject::Constraint { table, .. } = object else {
                    return Err(error(DbErrorKind::Other, "foreign key without table"));
                };
                let foreign_key = MemoryForeignKey {
                    table: table.clone(),
                    column: column.clone(),
                    parent: parent.clone(),
                    parent_column: parent_column.clone(),
                };
                let child = state
                    .tables
                    .get(table)
                    .ok_or_else(|| undefined_table(table))?;
                let position = child.spec.position(column).ok_or_else(|| {
                    error(DbErrorKind::UndefinedObject, format!("column {column} missing"))
                })?;
                for row in &child.rows {
                    if let Some(value) = row.get(position) {
                        check_reference(state, &foreign_key, value, &[])?;
                    }
                }
                state.foreign_keys.push(foreign_key);
                state.objects.push(object.clone());
            }
            SchemaChange::Index { object } | SchemaChange::Function { object } => {
                if !state.namespaces.contains(object_namespace(object)) {
                    return Err(error(
                        DbErrorKind::UndefinedObject,
                        format!("schema \"{}\" does not exist", object_namespace(object)),
                    ));
                }
                if !state.objects.contains(object) {
                    state.objects.push(object.clone());
                }
            }
            SchemaChange::Comment { table } => {
                if !state.tables.contains_key(table) {
                    return Err(undefined_table(table));
                }
            }
        }
        Ok(())
    }
}

fn undefined_table(table: &QualifiedName) -> DbError {
    DbError {
        kind: DbErrorKind::UndefinedObject,
        code: Some("42P01".to_string()),
        message: format!("relation \"{table}\" does not exist"),
    }
}

fn require_object_table(state: &MemoryState, object: &CatalogObject) -> DbResult<()> {
    match object {
        CatalogObject::Constraint { table, .. } | CatalogObject::Trigger { table, .. }
            if !state.tables.contains_key(table) =>
        {
            Err(undefined_table(table))
        }
        _ => Ok(()),
    }
}

/// Check one referencing value against the parent's stored and staged rows.
fn check_reference(
    state: &MemoryState,
    foreign_key: &MemoryForeignKey,
    value: &Value,
    staged_self_rows: &[Vec<Value>],
) -> DbResult<()> {
    let Some(key) = key_of(value) else {
        return Ok(());
    };
    let parent = state
        .tables
        .get(&foreign_key.parent)
        .ok_or_else(|| undefined_table(&foreign_key.parent))?;
    let Some(position) = parent.spec.position(&foreign_key.parent_column) else {
        return Err(error(
            DbErrorKind::UndefinedObject,
            format!("column {} missing", foreign_key.parent_column),
        ));
    };
    let self_rows: &[Vec<Value>] = if foreign_key.parent == foreign_key.table {
        staged_self_rows
    } else {
        &[]
    };
    let found = parent
        .rows
        .iter()
        .chain(self_rows.iter())
        .any(|row| row.get(position).and_then(key_of).as_deref() == Some(key.as_str()));
    if found {
        Ok(())
    } else {
        Err(DbError {
            kind: DbErrorKind::ForeignKeyViolation,
            code: Some("23503".to_string()),
            message: format!(
                "insert or update on table \"{}\" violates foreign key on {}: \
                 key ({})=({key}) is not present in \"{}\"",
                foreign_key.table, foreign_key.column, foreign_key.parent_column, foreign_key.parent
            ),
        })
    }
}

/// Expand a supplied row to full width, filling defaults and identities.
fn build_row(
    spec: &TableSpec,
    table: &QualifiedName,
    positions: &[usize],
    row: &[Value],
    sequences: &mut BTreeMap<String, MemorySequence>,
) -> DbResult<Vec<Value>> {
    let mut supplied: Vec<Option<&Value>> = vec![None; spec.columns.len()];
    for (value, position) in row.iter().zip(positions) {
        supplied[*position] = Some(value);
    }

    let mut full = Vec::with_capacity(spec.columns.len());
    for (column, value) in spec.columns.iter().zip(supplied) {
        let value = match value {
            Some(Value::Default) | None => match sequences.get_mut(&column.name) {
                Some(sequence) => Value::Int(sequence.next()),
                None if column.default.is_some() => Value::Default,
                None => Value::Null,
            },
            Some(other) => other.clone(),
        };
        let is_pk = spec
            .primary_key
            .as_deref()
            .is_some_and(|pk| pk.eq_ignore_ascii_case(&column.name));
        if value.is_null() && (!column.nullable || is_pk) {
            return Err(DbError {
                kind: DbErrorKind::NotNullViolation,
                code: Some("23502".to_string()),
                message: format!(
                    "null value in column \"{}\" of relation \"{table}\" \
                     violates not-null constraint",
                    column.name
                ),
            });
        }
        full.push(value);
    }
    Ok(full)
}

fn check_primary_key(
    spec: &TableSpec,
    table: &QualifiedName,
    row: &[Value],
    existing: &[Vec<Value>],
    staged: &[Vec<Value>],
) -> DbResult<()> {
    let Some(position) = spec.primary_key.as_deref().and_then(|pk| spec.position(pk)) else {
        return Ok(());
    };
    let Some(key) = row.get(position).and_then(key_of) else {
        return Ok(());
    };
    let duplicate = existing
        .iter()
        .chain(staged)
        .any(|other| other.get(position).and_then(key_of).as_deref() == Some(key.as_str()));
    if duplicate {
        return Err(DbError {
            kind: DbErrorKind::UniqueViolation,
            code: Some("23505".to_string()),
            message: format!(
                "duplicate key value violates unique constraint \"{}_pkey\": ({key})",
                table.table
            ),
        });
    }
    Ok(())
}

#[async_trait]
impl Destination for MemoryDestination {
    fn engine(&self) -> &'static str {
        "memory"
    }

    async fn execute(&self, sql: &str) -> DbResult<()> {
        self.lock()?.executed.push(sql.to_string());
        Ok(())
    }

    async fn drop_namespace(&self, namespace: &str) -> DbResult<()> {
        let mut state = self.lock()?;
        state.namespaces.remove(namespace);
        state.tables.retain(|table, _| table.namespace != namespace);
        state
            .objects
            .retain(|object| object_namespace(object) != namespace);
        state
            .foreign_keys
            .retain(|fk| fk.table.namespace != namespace && fk.parent.namespace != namespace);
        state.executed.push(format!("DROP SCHEMA IF EXISTS {namespace} CASCADE"));
        Ok(())
    }

    async fn apply(&self, statement: &DdlStatement) -> DbResult<()> {
        let mut state = self.lock()?;
        self.apply_change(&mut state, statement)?;
        state.executed.push(statement.sql.clone());
        Ok(())
    }

    async fn object_exists(&self, object: &CatalogObject) -> DbResult<bool> {
        Ok(self.lock()?.objects.contains(object))
    }

    async fn existing_tables(&self, namespaces: &[String]) -> DbResult<Vec<QualifiedName>> {
        Ok(self
            .lock()?
            .tables
            .keys()
            .filter(|table| namespaces.contains(&table.namespace))
            .cloned()
            .collect())
    }

    async fn existing_columns(&self, table: &QualifiedName) -> DbResult<Vec<ExistingColumn>> {
        let state = self.lock()?;
        let memory = state.tables.get(table).ok_or_else(|| undefined_table(table))?;
        Ok(memory
            .spec
            .columns
            .iter()
            .map(|column| ExistingColumn {
                name: column.name.clone(),
                data_type: column.semantic_type.sql_type(),
                nullable: column.nullable,
                has_default: column.default.is_some(),
                identity: column.identity,
            })
            .collect())
    }

    async fn truncate(&self, tables: &[QualifiedName]) -> DbResult<()> {
        let mut state = self.lock()?;
        for table in tables {
            let memory = state
                .tables
                .get_mut(table)
                .ok_or_else(|| undefined_table(table))?;
            memory.rows.clear();
            memory
                .sequences
                .values_mut()
                .for_each(MemorySequence::restart);
        }
        let names: Vec<String> = tables.iter().map(ToString::to_string).collect();
        state.executed.push(format!(
            "TRUNCATE TABLE {} RESTART IDENTITY CASCADE",
            names.join(", ")
        ));
        Ok(())
    }

    async fn ledger_contains(&self, ledger: &QualifiedName, key: &str) -> DbResult<bool> {
        let state = self.lock()?;
        let memory = state.tables.get(ledger).ok_or_else(|| undefined_table(ledger))?;
        Ok(memory
            .rows
            .iter()
            .any(|row| matches!(row.first(), Some(Value::Text(stored)) if stored == key)))
    }

    async fn insert_batch(&self, request: &InsertRequest<'_>) -> DbResult<InsertOutcome> {
        let mut state = self.lock()?;
        let memory = state
            .tables
            .get(request.table)
            .ok_or_else(|| undefined_table(request.table))?;
        let spec = memory.spec.clone();
        let positions = request
            .columns
            .iter()
            .map(|name| {
                spec.position(name).ok_or_else(|| {
                    error(
                        DbErrorKind::UndefinedObject,
                        format!(
                            "column \"{name}\" of relation \"{}\" does not exist",
                            request.table
                        ),
                    )
                })
            })
            .collect::<DbResult<Vec<_>>>()?;
        let mut sequences = memory.sequences.clone();
        let foreign_keys: Vec<MemoryForeignKey> = state
            .foreign_keys
            .iter()
            .filter(|fk| &fk.table == request.table)
            .cloned()
            .collect();

        let mut staged: Vec<Vec<Value>> = Vec::new();
        let mut outcome = InsertOutcome::default();
        let mut rejected_keys = RejectedKeys::new(request);

        for (index, row) in request.rows.iter().enumerate() {
            if let Some(reason) = rejected_keys.blocked(row) {
                rejected_keys.reject(row);
                outcome
                    .rejected
                    .push(rejection(request.source_rows, index, reason));
                continue;
            }
            let attempt = build_row(&spec, request.table, &positions, row, &mut sequences)
                .and_then(|full| {
                    check_primary_key(&spec, request.table, &full, &memory.rows, &staged)?;
                    for fk in &foreign_keys {
                        if let Some(position) = spec.position(&fk.column) {
                            if let Some(value) = full.get(position) {
                                check_reference(&state, fk, value, &staged)?;
                            }
                        }
                    }
                    Ok(full)
                });

            match attempt {
                Ok(full) => {
                    rejected_keys.accept(row);
                    staged.push(full);
                }
                Err(err)
                    if request.strictness == Strictness::Lenient && err.kind.is_row_level() =>
                {
                    rejected_keys.reject(row);
                    outcome
                        .rejected
                        .push(rejection(request.source_rows, index, err.message));
                }
                Err(err) => return Err(err),
            }
        }

        outcome.inserted = staged.len();

        if let Some(entry) = &request.ledger {
            let ledger = state
                .tables
                .get_mut(entry.ledger)
                .ok_or_else(|| undefined_table(entry.ledger))?;
            if ledger
                .rows
                .iter()
                .any(|row| matches!(row.first(), Some(Value::Text(stored)) if stored == entry.key))
            {
                return Err(error(
                    DbErrorKind::UniqueViolation,
                    format!("idempotency key {} already recorded", entry.key),
                ));
            }
            ledger.rows.push(vec![
                Value::Text(entry.key.to_string()),
                Value::Text(request.table.to_string()),
                Value::Int(outcome.inserted as i64),
                Value::Default,
            ]);
        }

        let memory = state
            .tables
            .get_mut(request.table)
            .ok_or_else(|| undefined_table(request.table))?;
        memory.rows.extend(staged);
        memory.sequences = sequences;
        Ok(outcome)
    }

    async fn update_references(&self, request: &ReferenceUpdate<'_>) -> DbResult<InsertOutcome> {
        let mut state = self.lock()?;
        let memory = state
            .tables
            .get(request.table)
            .ok_or_else(|| undefined_table(request.table))?;
        let missing_column = |name: &str| {
            error(
                DbErrorKind::UndefinedObject,
                format!("column \"{name}\" of relation \"{}\" does not exist", request.table),
            )
        };
        let key_position = memory
            .spec
            .position(request.key_column)
            .ok_or_else(|| missing_column(request.key_column))?;
        let position = memory
            .spec
            .position(request.column)
            .ok_or_else(|| missing_column(request.column))?;
        let mut rows = memory.rows.clone();
        let foreign_keys: Vec<MemoryForeignKey> = state
            .foreign_keys
            .iter()
            .filter(|fk| {
                &fk.table == request.table && fk.column.eq_ignore_ascii_case(request.column)
            })
            .cloned()
            .collect();

        let mut outcome = InsertOutcome::default();
        for (index, (key, value)) in request.rows.iter().enumerate() {
            let Some(key) = key_of(key) else {
                continue;
            };
            let Some(target) = rows.iter().position(|row| {
                row.get(key_position).and_then(key_of).as_deref() == Some(key.as_str())
            }) else {
                continue;
            };
            let checked = foreign_keys
                .iter()
                .try_for_each(|fk| check_reference(&state, fk, value, &rows));
            match checked {
                Ok(()) => {
                    if let Some(cell) = rows.get_mut(target).and_then(|row| row.get_mut(position)) {
                        *cell = value.clone();
                        outcome.inserted += 1;
                    }
                }
                Err(err)
                    if request.strictness == Strictness::Lenient && err.kind.is_row_level() =>
                {
                    outcome
                        .rejected
                        .push(rejection(request.source_rows, index, err.message));
                }
                Err(err) => return Err(err),
            }
        }

        let memory = state
            .tables
            .get_mut(request.table)
            .ok_or_else(|| undefined_table(request.table))?;
        memory.rows = rows;
        state.executed.push(format!(
            "UPDATE {} SET {} = ... WHERE {} = ... ({} rows)",
            request.table, request.column, request.key_column, outcome.inserted
        ));
        Ok(outcome)
    }

    async fn identity_state(
        &self,
        table: &QualifiedName,
        column: &str,
    ) -> DbResult<Option<IdentityState>> {
        let state = self.lock()?;
        let memory = state.tables.get(table).ok_or_else(|| undefined_table(table))?;
        let Some(position) = memory.spec.position(column) else {
            return Err(error(
                DbErrorKind::UndefinedObject,
                format!("column \"{column}\" of relation \"{table}\" does not exist"),
            ));
        };
        let name = &memory.spec.columns[position].name;
        let Some(sequence) = memory.sequences.get(name) else {
            return Ok(None);
        };
        let max_key = memory
            .rows
            .iter()
            .filter_map(|row| row.get(position).and_then(Value::as_i64))
            .max();
        Ok(Some(IdentityState {
            sequence: sequence.name.clone(),
            max_key,
            next_value: sequence.next_value(),
            start_value: SEQUENCE_START,
        }))
    }

    async fn set_identity(&self, sequence: &str, last_value: i64) -> DbResult<()> {
        if self.deny_sequences {
            return Err(error(
                DbErrorKind::InsufficientPrivilege,
                format!("permission denied for sequence {sequence}"),
            ));
        }
        if last_value < SEQUENCE_START {
            return Err(DbError {
                kind: DbErrorKind::DataException,
                code: Some("22003".to_string()),
                message: format!(
                    "setval: value {last_value} is out of bounds for sequence \"{sequence}\""
                ),
            });
        }
        let mut state = self.lock()?;
        let target = state
            .tables
            .values_mut()
            .flat_map(|table| table.sequences.values_mut())
            .find(|candidate| candidate.name == sequence)
            .ok_or_else(|| {
                error(
                    DbErrorKind::UndefinedObject,
                    format!("relation \"{sequence}\" does not exist"),
                )
            })?;
        target.last_value = last_value;
        target.is_called = true;
        state
            .executed
            .push(format!("SELECT setval('{sequence}', {last_value}, true)"));
        Ok(())
    }

    async fn analyze(&self, table: &QualifiedName) -> DbResult<()> {
        let mut state = self.lock()?;
        if !state.tables.contains_key(table) {
            return Err(undefined_table(table));
        }
        state.analyzed.push(table.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::pre_load_statements;
    use dataloom_core::{
        Catalog, ColumnSpec, ForeignKeyRef, IdentityGeneration, NamespaceNames, NamespaceRole,
        OnDelete, SemanticType, TableRef,
    };

    fn catalog() -> Catalog {
        let column = |name: &str, nullable: bool, identity: Option<IdentityGeneration>| ColumnSpec {
            name: name.to_string(),
            semantic_type: SemanticType::BigInt,
            nullable,
            default: None,
            identity,
            comment: None,
        };
        Catalog {
            catalog_version: "1".to_string(),
            tables: vec![TableSpec {
                namespace: NamespaceRole::Business,
                name: "items".to_string(),
                source: None,
                comment: None,
                columns: vec![
                    column("id", false, Some(IdentityGeneration::ByDefault)),
                    column("qty", false, None),
                ],
                primary_key: Some("id".to_string()),
                foreign_keys: Vec::new(),
                checks: Vec::new(),
                enumerations: Vec::new(),
                uniques: Vec::new(),
                indexes: Vec::new(),
                soft_delete_column: "deleted_at".to_string(),
            }],
        }
    }

    async fn prepared() -> (MemoryDestination, Catalog) {
        let destination = MemoryDestination::new();
        let catalog = catalog();
        for statement in pre_load_statements(&catalog, &NamespaceNames::default()) {
            destination.apply(&statement).await.expect("apply");
        }
        (destination, catalog)
    }

    fn request<'a>(
        table: &'a QualifiedName,
        spec: &'a TableSpec,
        columns: &'a [String],
        rows: &'a [Vec<Value>],
        source_rows: &'a [usize],
        strictness: Strictness,
    ) -> InsertRequest<'a> {
        InsertRequest {
            table,
            spec,
            columns,
            rows,
            source_rows,
            strictness,
            chunk_size: 100,
            ledger: None,
        }
    }

    #[tokio::test]
    async fn defaults_draw_from_the_identity_generator() {
        let (destination, catalog) = prepared().await;
        let table = QualifiedName::new("core", "items");
        let columns = vec!["id".to_string(), "qty".to_string()];
        let rows = vec![
            vec![Value::Default, Value::Int(5)],
            vec![Value::Default, Value::Int(6)],
        ];
        let outcome = destination
            .insert_batch(&request(
                &table,
                &catalog.tables[0],
                &columns,
                &rows,
                &[0, 1],
                Strictness::Strict,
            ))
            .await
            .expect("insert");
        assert_eq!(outcome.inserted, 2);
        assert_eq!(
            destination.column_values(&table, "id"),
            vec![Value::Int(1), Value::Int(2)]
        );
        assert_eq!(destination.next_identity(&table, "id"), Some(3));
    }

    #[tokio::test]
    async fn strict_inserts_are_all_or_nothing() {
        let (destination, catalog) = prepared().await;
        let table = QualifiedName::new("core", "items");
        let columns = vec!["id".to_string(), "qty".to_string()];
        let rows = vec![
            vec![Value::Int(1), Value::Int(5)],
            vec![Value::Int(1), Value::Int(6)],
            vec![Value::Int(2), Value::Null],
        ];
        let spec = &catalog.tables[0];

        let err = destination
            .insert_batch(&request(&table, spec, &columns, &rows, &[0, 1, 2], Strictness::Strict))
            .await
            .expect_err("duplicate key");
        assert_eq!(err.kind, DbErrorKind::UniqueViolation);
        assert_eq!(destination.row_count(&table), 0);

        let outcome = destination
            .insert_batch(&request(&table, spec, &columns, &rows, &[0, 1, 2], Strictness::Lenient))
            .await
            .expect("lenient insert");
        assert_eq!(outcome.inserted, 1);
        let rejected: Vec<usize> = outcome.rejected.iter().map(|r| r.row).collect();
        assert_eq!(rejected, vec![1, 2]);
    }

    #[tokio::test]
    async fn truncate_restarts_identity() {
        let (destination, catalog) = prepared().await;
        let table = QualifiedName::new("core", "items");
        let columns = vec!["qty".to_string()];
        let rows = vec![vec![Value::Int(5)]];
        destination
            .insert_batch(&request(
                &table,
                &catalog.tables[0],
                &columns,
                &rows,
                &[0],
                Strictness::Strict,
            ))
            .await
            .expect("insert");
        assert_eq!(destination.next_identity(&table, "id"), Some(2));

        destination.truncate(std::slice::from_ref(&table)).await.expect("truncate");
        assert_eq!(destination.row_count(&table), 0);
        assert_eq!(destination.next_identity(&table, "id"), Some(1));
    }

    fn tree() -> TableSpec {
        let mut spec = catalog().tables.remove(0);
        spec.name = "nodes".to_string();
        spec.columns[0].identity = None;
        spec.columns.push(ColumnSpec {
            name: "parent_id".to_string(),
            semantic_type: SemanticType::BigInt,
            nullable: true,
            default: None,
            identity: None,
            comment: None,
        });
        spec.foreign_keys.push(ForeignKeyRef {
            name: None,
            column: "parent_id".to_string(),
            references: TableRef {
                namespace: NamespaceRole::Business,
                table: "nodes".to_string(),
                column: "id".to_string(),
            },
            on_delete: OnDelete::default(),
        });
        spec
    }

    #[tokio::test]
    async fn children_of_a_refused_row_are_refused_in_cascade() {
        let destination = MemoryDestination::new();
        let spec = tree();
        let catalog = Catalog {
            catalog_version: "1".to_string(),
            tables: vec![spec.clone()],
        };
        for statement in pre_load_statements(&catalog, &NamespaceNames::default()) {
            destination.apply(&statement).await.expect("apply");
        }
        let table = QualifiedName::new("core", "nodes");
        let columns = vec!["id".to_string(), "qty".to_string(), "parent_id".to_string()];
        let rows = vec![
            vec![Value::Int(1), Value::Int(5), Value::Null],
            vec![Value::Int(2), Value::Null, Value::Int(1)],
            vec![Value::Int(3), Value::Int(7), Value::Int(2)],
            vec![Value::Int(4), Value::Int(8), Value::Int(3)],
            vec![Value::Int(1), Value::Int(9), Value::Null],
            vec![Value::Int(5), Value::Int(9), Value::Int(1)],
        ];
        let source_rows = [0, 1, 2, 3, 4, 5];
        let outcome = destination
            .insert_batch(&request(
                &table,
                &spec,
                &columns,
                &rows,
                &source_rows,
                Strictness::Lenient,
            ))
            .await
            .expect("lenient insert");

        assert_eq!(outcome.inserted, 2);
        let refused: Vec<usize> = outcome.rejected.iter().map(|rejection| rejection.row).collect();
        assert_eq!(refused, vec![1, 2, 3, 4]);
        assert!(outcome.rejected[0].reason.contains("not-null"));
        assert!(outcome.rejected[1].reason.contains("(parent_id)=(2)"));
        assert!(outcome.rejected[2].reason.contains("(parent_id)=(3)"));
        assert_eq!(
            destination.column_values(&table, "id"),
            vec![Value::Int(1), Value::Int(5)]
        );
    }
}
