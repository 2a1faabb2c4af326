//! JSON Schema checks for federation documents
//!
//! Schemas live in `tests/schemas/<name>.json` and are Draft 7.

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::path::PathBuf;

fn compile_schema(name: &str) -> JSONSchema {
    let path: PathBuf = [env!("CARGO_MANIFEST_DIR"), "tests", "schemas", &format!("{name}.json")]
        .iter()
        .collect();
    let raw = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
    let schema: Value = serde_json::from_str(&raw)
        .unwrap_or_else(|e| panic!("{} is not JSON: {e}", path.display()));

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .unwrap_or_else(|e| panic!("{} does not compile: {e}", path.display()))
}

/// Assert that `document` matches the named schema, listing every violation
pub fn assert_matches_schema(document: &Value, name: &str) {
    let schema = compile_schema(name);
    let violations: Vec<String> = match schema.validate(document) {
        Ok(()) => return,
        Err(errors) => errors
            .map(|error| format!("  {} (at {})", error, error.instance_path))
            .collect(),
    };

    panic!(
        "document does not match schema {name}:\n{}\n{document:#}",
        violations.join("\n")
    );
}
