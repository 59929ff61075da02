use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Destination type of a catalog column.
///
/// Written in catalog files as a PostgreSQL-flavoured type name
/// (`bigint`, `numeric(12,2)`, `varchar(80)`, `timestamptz`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SemanticType {
    SmallInt,
    Integer,
    BigInt,
    Numeric {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Double,
    Text,
    Varchar(u32),
    Boolean,
    Date,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
}

impl SemanticType {
    /// SQL type used in column definitions and bind casts.
    pub fn sql_type(&self) -> String {
        match self {
            SemanticType::SmallInt => "smallint".to_string(),
            SemanticType::Integer => "integer".to_string(),
            SemanticType::BigInt => "bigint".to_string(),
            SemanticType::Numeric {
                precision: Some(precision),
                scale: Some(scale),
            } => format!("numeric({precision},{scale})"),
            SemanticType::Numeric {
                precision: Some(precision),
                scale: None,
            } => format!("numeric({precision})"),
            SemanticType::Numeric { .. } => "numeric".to_string(),
            SemanticType::Double => "double precision".to_string(),
            SemanticType::Text => "text".to_string(),
            SemanticType::Varchar(len) => format!("varchar({len})"),
            SemanticType::Boolean => "boolean".to_string(),
            SemanticType::Date => "date".to_string(),
            SemanticType::Timestamp => "timestamp".to_string(),
            SemanticType::TimestampTz => "timestamptz".to_string(),
            SemanticType::Uuid => "uuid".to_string(),
            SemanticType::Json => "jsonb".to_string(),
        }
    }

    /// True for the integer family, the only types that can back an identity.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            SemanticType::SmallInt | SemanticType::Integer | SemanticType::BigInt
        )
    }

    /// True for types whose empty-string values are kept as-is.
    pub fn is_textual(&self) -> bool {
        matches!(self, SemanticType::Text | SemanticType::Varchar(_))
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_type())
    }
}

impl FromStr for SemanticType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_lowercase();
        let (base, args) = match normalized.split_once('(') {
            Some((base, rest)) => {
                let args = rest
                    .strip_suffix(')')
                    .ok_or_else(|| format!("unbalanced type arguments in '{raw}'"))?;
                (base.trim().to_string(), Some(args.to_string()))
            }
            None => (normalized.clone(), None),
        };

        let parsed = match (base.as_str(), args) {
            ("smallint" | "int2", None) => SemanticType::SmallInt,
            ("integer" | "int" | "int4", None) => SemanticType::Integer,
            ("bigint" | "int8", None) => SemanticType::BigInt,
            ("numeric" | "decimal", None) => SemanticType::Numeric {
                precision: None,
                scale: None,
            },
            ("numeric" | "decimal", Some(args)) => {
                let mut parts = args.split(',').map(|part| part.trim().parse::<u32>());
                let precision = parts
                    .next()
                    .transpose()
                    .map_err(|_| format!("invalid numeric precision in '{raw}'"))?;
                let scale = parts
                    .next()
                    .transpose()
                    .map_err(|_| format!("invalid numeric scale in '{raw}'"))?;
                if parts.next().is_some() {
                    return Err(format!("too many numeric arguments in '{raw}'"));
                }
                if let (Some(precision), Some(scale)) = (precision, scale) {
                    if scale > precision {
                        return Err(format!("numeric scale exceeds precision in '{raw}'"));
                    }
                }
                SemanticType::Numeric { precision, scale }
            }
            ("double" | "double precision" | "float8" | "float", None) => SemanticType::Double,
            ("text" | "string", None) => SemanticType::Text,
            ("varchar" | "character varying", Some(args)) => {
                let len = args
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| format!("invalid varchar length in '{raw}'"))?;
                if len == 0 {
                    return Err(format!("varchar length must be positive in '{raw}'"));
                }
                SemanticType::Varchar(len)
            }
            ("varchar" | "character varying", None) => SemanticType::Text,
            ("boolean" | "bool", None) => SemanticType::Boolean,
            ("date", None) => SemanticType::Date,
            ("timestamp" | "timestamp without time zone", None) => SemanticType::Timestamp,
            ("timestamptz" | "timestamp with time zone", None) => SemanticType::TimestampTz,
            ("uuid", None) => SemanticType::Uuid,
            ("json" | "jsonb", None) => SemanticType::Json,
            _ => return Err(format!("unsupported column type '{raw}'")),
        };

        Ok(parsed)
    }
}

impl TryFrom<String> for SemanticType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SemanticType> for String {
    fn from(value: SemanticType) -> Self {
        value.sql_type()
    }
}

/// Identity generation strategy for columns using `GENERATED ... AS IDENTITY`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdentityGeneration {
    Always,
    ByDefault,
}

impl IdentityGeneration {
    pub fn sql_clause(self) -> &'static str {
        match self {
            IdentityGeneration::Always => "GENERATED ALWAYS AS IDENTITY",
            IdentityGeneration::ByDefault => "GENERATED BY DEFAULT AS IDENTITY",
        }
    }
}
