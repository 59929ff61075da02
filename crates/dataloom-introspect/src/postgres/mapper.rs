use dataloom_core::{IdentityGeneration, QualifiedName};

use super::ExistingColumn;
use super::queries::{RawColumn, RawTable};

pub fn map_tables(raw: Vec<RawTable>) -> Vec<QualifiedName> {
    raw.into_iter()
        .map(|table| QualifiedName::new(table.namespace, table.name))
        .collect()
}

pub fn map_columns(raw: Vec<RawColumn>) -> Vec<ExistingColumn> {
    raw.into_iter()
        .map(|column| ExistingColumn {
            name: column.name,
            data_type: column.data_type,
            nullable: column.nullable,
            has_default: column.has_default,
            identity: identity_from_code(column.identity.as_deref()),
        })
        .collect()
}

fn identity_from_code(code: Option<&str>) -> Option<IdentityGeneration> {
    match code {
        Some("a") => Some(IdentityGeneration::Always),
        Some("d") => Some(IdentityGeneration::ByDefault),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_identity_codes() {
        let columns = map_columns(vec![
            RawColumn {
                name: "id".to_string(),
                data_type: "bigint".to_string(),
                nullable: false,
                has_default: false,
                identity: Some("a".to_string()),
            },
            RawColumn {
                name: "note".to_string(),
                data_type: "text".to_string(),
                nullable: true,
                has_default: false,
                identity: None,
            },
        ]);
        assert_eq!(columns[0].identity, Some(IdentityGeneration::Always));
        assert_eq!(columns[1].identity, None);
    }
}
