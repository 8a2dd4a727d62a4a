//! JSON Schema compilation and validation helpers.

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde_json::Value;

/// Compile a bundled schema given as raw JSON text.
pub fn compile_schema(label: &str, raw: &str) -> Result<Validator> {
    let schema: Value =
        serde_json::from_str(raw).with_context(|| format!("parse {label} schema"))?;
    jsonschema::validator_for(&schema).map_err(|err| anyhow!("invalid {label} schema: {err}"))
}

/// Collect validation error messages for `instance`. Empty means valid.
pub fn schema_errors(validator: &Validator, instance: &Value) -> Vec<String> {
    validator
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect()
}

/// Validate `instance`, joining all violations into one error.
pub fn ensure_valid(label: &str, validator: &Validator, instance: &Value) -> Result<()> {
    let errors = schema_errors(validator, instance);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "{label} schema validation failed:\n- {}",
        errors.join("\n- ")
    ))
}
