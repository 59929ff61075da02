use std::fs;
use std::path::Path;

use jsonschema::JSONSchema;
use schemars::schema::RootSchema;
use schemars::schema_for;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::schema::Catalog;
use crate::validation::validate_catalog;

/// JSON Schema describing catalog documents.
pub fn catalog_schema() -> RootSchema {
    schema_for!(Catalog)
}

/// Parse and validate a catalog document.
///
/// Structural problems are reported with their JSON pointer before the
/// document is deserialized and checked for internal consistency.
pub fn parse_catalog(raw: &str) -> Result<Catalog> {
    let document: JsonValue = serde_json::from_str(raw)
        .map_err(|err| Error::InvalidCatalog(format!("malformed JSON: {err}")))?;

    let schema = serde_json::to_value(catalog_schema())
        .map_err(|err| Error::Other(format!("catalog schema serialization failed: {err}")))?;
    let compiled =
        JSONSchema::compile(&schema).map_err(|err| Error::Other(err.to_string()))?;

    if let Err(errors) = compiled.validate(&document) {
        let issues: Vec<String> = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                let path = if path.is_empty() { "/".to_string() } else { path };
                format!("{path}: {error}")
            })
            .collect();
        return Err(Error::InvalidCatalog(issues.join("; ")));
    }

    let catalog: Catalog = serde_json::from_value(document)
        .map_err(|err| Error::InvalidCatalog(err.to_string()))?;
    validate_catalog(&catalog)?;
    Ok(catalog)
}

/// Read a catalog file from disk.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let raw = fs::read_to_string(path).map_err(|err| {
        Error::InvalidCatalog(format!("cannot read {}: {err}", path.display()))
    })?;
    parse_catalog(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_structural_errors_with_pointer() {
        let raw = r#"{"catalog_version": "1", "tables": [{"name": "users"}]}"#;
        let err = parse_catalog(raw).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/tables/0"), "{message}");
        assert!(message.contains("columns"), "{message}");
    }

    #[test]
    fn rejects_unknown_semantic_type() {
        let raw = r#"{
            "catalog_version": "1",
            "tables": [{"name": "t", "columns": [{"name": "id", "type": "money"}]}]
        }"#;
        let err = parse_catalog(raw).unwrap_err();
        assert!(err.to_string().contains("unsupported column type"));
    }
}
