//! Engine errors.

use ember_world::{RunFailure, WorldError};

/// Errors returned by the engine's public API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// No workflow is registered under this name.
  #[error("workflow '{name}' is not registered")]
  WorkflowNotFound { name: String },

  /// No run with this id exists.
  #[error("run '{run_id}' not found")]
  RunNotFound { run_id: String },

  /// No active hook or webhook uses this token.
  #[error("no active hook for token '{token}'")]
  HookNotFound { token: String },

  /// The single-shot hook was already resumed.
  #[error("hook '{token}' was already resumed")]
  HookAlreadyResumed { token: String },

  /// The payload does not match the hook's schema.
  #[error("payload rejected by hook '{token}': {}", .errors.join("; "))]
  InvalidPayload { token: String, errors: Vec<String> },

  /// The webhook handler finished without answering the request.
  #[error("webhook '{token}' request '{request_id}' was not answered: {reason}")]
  ResponseNotSent {
    token: String,
    request_id: String,
    reason: String,
  },

  /// No response arrived before the configured timeout.
  #[error("timed out waiting for webhook '{token}' to respond")]
  ResponseTimeout { token: String },

  /// The run ended without an output.
  #[error("run '{run_id}' did not complete: {failure}")]
  RunFailed { run_id: String, failure: RunFailure },

  /// Only finished runs can be purged.
  #[error("run '{run_id}' is still active")]
  RunActive { run_id: String },

  /// Input or output could not be converted to or from JSON.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The backend failed.
  #[error("world error: {0}")]
  World(#[source] WorldError),
}

impl From<WorldError> for EngineError {
  fn from(err: WorldError) -> Self {
    match err {
      WorldError::RunNotFound(run_id) => EngineError::RunNotFound { run_id },
      WorldError::TokenNotFound(token) => EngineError::HookNotFound { token },
      WorldError::TokenConsumed(token) => EngineError::HookAlreadyResumed { token },
      other => EngineError::World(other),
    }
  }
}
