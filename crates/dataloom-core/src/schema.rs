use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::constraints::{CheckSpec, EnumerationSpec, ForeignKeyRef, IndexSpec, UniqueSpec};
use crate::types::{IdentityGeneration, SemanticType};

/// Static description of every destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Catalog {
    /// Contract version for the catalog format.
    pub catalog_version: String,
    pub tables: Vec<TableSpec>,
}

impl Catalog {
    /// Look up a table by namespace role and name.
    pub fn table(&self, namespace: NamespaceRole, name: &str) -> Option<&TableSpec> {
        self.tables
            .iter()
            .find(|table| table.namespace == namespace && table.name == name)
    }

    /// Tables that declare a column with the given name.
    pub fn tables_with_column(&self, column: &str) -> Vec<&TableSpec> {
        self.tables
            .iter()
            .filter(|table| table.column(column).is_some())
            .collect()
    }

    /// Tables whose primary key is generated by an identity column.
    pub fn identity_tables(&self) -> Vec<&TableSpec> {
        self.tables
            .iter()
            .filter(|table| table.identity_key().is_some())
            .collect()
    }
}

/// Logical grouping a table belongs to; resolved to a concrete namespace at runtime.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceRole {
    #[default]
    Business,
    Ingest,
    Audit,
}

/// Concrete namespace names for each role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamespaceNames {
    pub business: String,
    pub ingest: String,
    pub audit: String,
}

impl Default for NamespaceNames {
    fn default() -> Self {
        Self {
            business: "core".to_string(),
            ingest: "ingest".to_string(),
            audit: "audit".to_string(),
        }
    }
}

impl NamespaceNames {
    pub fn resolve(&self, role: NamespaceRole) -> &str {
        match role {
            NamespaceRole::Business => &self.business,
            NamespaceRole::Ingest => &self.ingest,
            NamespaceRole::Audit => &self.audit,
        }
    }

    /// Distinct namespace names in role order.
    pub fn all(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(3);
        for role in [
            NamespaceRole::Business,
            NamespaceRole::Ingest,
            NamespaceRole::Audit,
        ] {
            let name = self.resolve(role);
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn qualify(&self, role: NamespaceRole, table: &str) -> QualifiedName {
        QualifiedName::new(self.resolve(role), table)
    }
}

/// Namespace-qualified table name. Orders lexically by namespace, then table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualifiedName {
    pub namespace: String,
    pub table: String,
}

impl QualifiedName {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
        }
    }

    /// Quoted SQL form, e.g. `"core"."orders"`.
    pub fn sql(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.namespace),
            quote_ident(&self.table)
        )
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.table)
    }
}

/// Quote a SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Destination table contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TableSpec {
    #[serde(default)]
    pub namespace: NamespaceRole,
    pub name: String,
    /// Batch key when it differs from the table name.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyRef>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    #[serde(default)]
    pub enumerations: Vec<EnumerationSpec>,
    #[serde(default)]
    pub uniques: Vec<UniqueSpec>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default = "default_soft_delete_column")]
    pub soft_delete_column: String,
}

fn default_soft_delete_column() -> String {
    "deleted_at".to_string()
}

impl TableSpec {
    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        let name = name.trim();
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn primary_key_column(&self) -> Option<&ColumnSpec> {
        self.primary_key
            .as_deref()
            .and_then(|name| self.column(name))
    }

    /// Primary key column when it is an identity or a serial-style column.
    pub fn identity_key(&self) -> Option<&ColumnSpec> {
        self.primary_key_column()
            .filter(|column| column.semantic_type.is_integer() && column.identity.is_some())
    }

    /// Whether a batch must supply this column.
    pub fn is_required(&self, column: &ColumnSpec) -> bool {
        let is_pk = self
            .primary_key
            .as_deref()
            .is_some_and(|pk| pk.eq_ignore_ascii_case(&column.name));
        (column.is_required() || is_pk) && column.default.is_none() && column.identity.is_none()
    }

    /// Key used to match input batches against this table.
    pub fn source_key(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    pub fn qualified(&self, names: &NamespaceNames) -> QualifiedName {
        names.qualify(self.namespace, &self.name)
    }

    pub fn foreign_key_name(&self, fk: &ForeignKeyRef) -> String {
        fk.name
            .clone()
            .unwrap_or_else(|| format!("{}_{}_fkey", self.name, fk.column))
    }

    pub fn references_self(&self, fk: &ForeignKeyRef) -> bool {
        fk.references.namespace == self.namespace && fk.references.table == self.name
    }
}

/// Column contract for a destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    #[schemars(with = "String")]
    pub semantic_type: SemanticType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// SQL default expression.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub identity: Option<IdentityGeneration>,
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSpec {
    /// Non-nullable without any way for the destination to fill it in.
    pub fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none() && self.identity.is_none()
    }
}
