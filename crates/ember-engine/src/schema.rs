//! Payload validation for typed hooks.

use crate::error::EngineError;

/// Check `payload` against a hook's JSON Schema.
pub(crate) fn validate(
  token: &str,
  schema: &serde_json::Value,
  payload: &serde_json::Value,
) -> Result<(), EngineError> {
  let reject = |errors: Vec<String>| EngineError::InvalidPayload {
    token: token.to_string(),
    errors,
  };

  let validator = jsonschema::draft202012::new(schema)
    .map_err(|e| reject(vec![format!("invalid schema: {e}")]))?;
  if validator.is_valid(payload) {
    return Ok(());
  }
  Err(reject(
    validator.iter_errors(payload).map(|e| e.to_string()).collect(),
  ))
}
