use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::schema::NamespaceRole;

/// Foreign key `ON DELETE` semantics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl OnDelete {
    pub fn sql(self) -> &'static str {
        match self {
            OnDelete::NoAction => "NO ACTION",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::SetDefault => "SET DEFAULT",
        }
    }
}

/// Target of a foreign key, addressed by namespace role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TableRef {
    #[serde(default)]
    pub namespace: NamespaceRole,
    pub table: String,
    #[serde(default = "default_referenced_column")]
    pub column: String,
}

fn default_referenced_column() -> String {
    "id".to_string()
}

/// Single-column foreign key from a table to another (or the same) table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ForeignKeyRef {
    /// Constraint name; defaults to `<table>_<column>_fkey`.
    #[serde(default)]
    pub name: Option<String>,
    pub column: String,
    pub references: TableRef,
    #[serde(default)]
    pub on_delete: OnDelete,
}

/// Check constraint with a raw SQL expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CheckSpec {
    pub name: String,
    pub expression: String,
}

/// Closed set of allowed values for a column, rendered as a check constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnumerationSpec {
    pub name: String,
    pub column: String,
    pub values: Vec<String>,
}

/// Unique constraint over one or more columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UniqueSpec {
    pub name: String,
    pub columns: Vec<String>,
}

/// Secondary index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Restrict the index to rows that are not soft-deleted.
    #[serde(default)]
    pub live_only: bool,
}
