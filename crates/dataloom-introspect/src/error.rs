use serde::Serialize;
use thiserror::Error;

/// Classification of destination failures by SQLSTATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbErrorKind {
    InsufficientPrivilege,
    DuplicateObject,
    UndefinedObject,
    ForeignKeyViolation,
    NotNullViolation,
    UniqueViolation,
    CheckViolation,
    DataException,
    Other,
}

impl DbErrorKind {
    pub fn from_sqlstate(code: &str) -> Self {
        match code {
            "42501" => DbErrorKind::InsufficientPrivilege,
            "42710" | "42P07" | "42P06" => DbErrorKind::DuplicateObject,
            "42P01" | "3F000" | "42704" => DbErrorKind::UndefinedObject,
            "23503" => DbErrorKind::ForeignKeyViolation,
            "23502" => DbErrorKind::NotNullViolation,
            "23505" => DbErrorKind::UniqueViolation,
            "23514" => DbErrorKind::CheckViolation,
            code if code.starts_with("22") => DbErrorKind::DataException,
            _ => DbErrorKind::Other,
        }
    }

    /// Failures caused by the values of a single row rather than the statement.
    pub fn is_row_level(self) -> bool {
        matches!(
            self,
            DbErrorKind::ForeignKeyViolation
                | DbErrorKind::NotNullViolation
                | DbErrorKind::UniqueViolation
                | DbErrorKind::CheckViolation
                | DbErrorKind::DataException
        )
    }
}

/// Destination failure with its classification.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    /// Raw SQLSTATE when the server reported one.
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn is_insufficient_privilege(&self) -> bool {
        self.kind == DbErrorKind::InsufficientPrivilege
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|code| code.into_owned());
                let kind = code
                    .as_deref()
                    .map(DbErrorKind::from_sqlstate)
                    .unwrap_or(DbErrorKind::Other);
                Self {
                    kind,
                    code,
                    message: db.message().to_string(),
                }
            }
            other => Self::new(DbErrorKind::Other, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sqlstates() {
        assert_eq!(
            DbErrorKind::from_sqlstate("42501"),
            DbErrorKind::InsufficientPrivilege
        );
        assert_eq!(
            DbErrorKind::from_sqlstate("22P02"),
            DbErrorKind::DataException
        );
        assert_eq!(
            DbErrorKind::from_sqlstate("42P07"),
            DbErrorKind::DuplicateObject
        );
        assert_eq!(DbErrorKind::from_sqlstate("08006"), DbErrorKind::Other);
    }

    #[test]
    fn row_level_kinds_are_constraint_and_data_failures() {
        assert!(DbErrorKind::ForeignKeyViolation.is_row_level());
        assert!(DbErrorKind::DataException.is_row_level());
        assert!(!DbErrorKind::InsufficientPrivilege.is_row_level());
        assert!(!DbErrorKind::UndefinedObject.is_row_level());
    }
}
