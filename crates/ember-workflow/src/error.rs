//! Error taxonomy for orchestrators and steps.

use chrono::{DateTime, Utc};
use ember_world::FailureKind;

/// Errors surfaced to orchestrator code by [`WorkflowContext`](crate::WorkflowContext)
/// calls, and returned by orchestrators to end a run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
  /// The call has no recorded result yet. Orchestrators propagate this with `?`.
  #[error("run suspended")]
  Suspended,

  /// A step failed terminally.
  #[error("step '{step}' ({step_id}) failed: {kind}: {message}")]
  StepFailed {
    step: String,
    step_id: String,
    kind: FailureKind,
    message: String,
  },

  /// Replay diverged from the recorded history.
  #[error("non-determinism at position {position}: expected {expected}, found {found}")]
  NonDeterminism {
    position: u32,
    expected: String,
    found: String,
  },

  /// A value could not be converted to or from JSON.
  #[error("serialization error: {0}")]
  Serialization(String),

  /// The hook or webhook token is held by another active suspension.
  #[error("token '{token}' is already in use")]
  TokenConflict { token: String },

  /// The run was cancelled.
  #[error("run cancelled")]
  Cancelled,

  /// Orchestrator-defined failure.
  #[error("{0}")]
  Failed(String),
}

impl WorkflowError {
  /// Convenience constructor for orchestrator-defined failures.
  pub fn failed(message: impl Into<String>) -> Self {
    WorkflowError::Failed(message.into())
  }

  /// Classification recorded on the failed run.
  pub fn failure_kind(&self) -> FailureKind {
    match self {
      WorkflowError::StepFailed { kind, .. } => *kind,
      WorkflowError::NonDeterminism { .. } => FailureKind::NonDeterminism,
      WorkflowError::Serialization(_) => FailureKind::Serialization,
      WorkflowError::TokenConflict { .. } => FailureKind::TokenConflict,
      WorkflowError::Cancelled => FailureKind::Cancelled,
      WorkflowError::Suspended | WorkflowError::Failed(_) => FailureKind::Fatal,
    }
  }
}

impl From<serde_json::Error> for WorkflowError {
  fn from(err: serde_json::Error) -> Self {
    WorkflowError::Serialization(err.to_string())
  }
}

/// When a retryable step should be attempted again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryAfter {
  /// After a delay from the failed attempt.
  Delay(std::time::Duration),
  /// At an absolute instant.
  At(DateTime<Utc>),
}

impl RetryAfter {
  /// Resolve to an absolute instant.
  pub fn instant(self, now: DateTime<Utc>) -> DateTime<Utc> {
    match self {
      RetryAfter::Delay(delay) => chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
      RetryAfter::At(at) => at.max(now),
    }
  }
}

/// Errors returned by step code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
  /// Not retried; the orchestrator sees a failure immediately.
  #[error("{0}")]
  Fatal(String),

  /// Retried at the given time.
  #[error("{message}")]
  Retryable {
    message: String,
    retry_after: RetryAfter,
  },

  /// Retried with the engine's backoff policy.
  #[error("{0}")]
  Unclassified(String),

  /// Input or output could not be converted to or from JSON. Not retried.
  #[error("serialization error: {0}")]
  Serialization(String),
}

impl StepError {
  pub fn fatal(message: impl Into<String>) -> Self {
    StepError::Fatal(message.into())
  }

  pub fn other(message: impl Into<String>) -> Self {
    StepError::Unclassified(message.into())
  }

  /// Retry after `delay`.
  pub fn retry_in(message: impl Into<String>, delay: std::time::Duration) -> Self {
    StepError::Retryable {
      message: message.into(),
      retry_after: RetryAfter::Delay(delay),
    }
  }

  /// Retry after `millis` milliseconds.
  pub fn retry_in_ms(message: impl Into<String>, millis: u64) -> Self {
    Self::retry_in(message, std::time::Duration::from_millis(millis))
  }

  /// Retry at an absolute instant.
  pub fn retry_at(message: impl Into<String>, at: DateTime<Utc>) -> Self {
    StepError::Retryable {
      message: message.into(),
      retry_after: RetryAfter::At(at),
    }
  }

  /// Whether the engine may attempt the step again.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      StepError::Retryable { .. } | StepError::Unclassified(_)
    )
  }
}

impl From<serde_json::Error> for StepError {
  fn from(err: serde_json::Error) -> Self {
    StepError::Serialization(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retry_after_resolves_to_instant() {
    let now = Utc::now();
    let delay = RetryAfter::Delay(std::time::Duration::from_secs(5));
    assert_eq!(delay.instant(now), now + chrono::Duration::seconds(5));

    // Instants in the past are clamped to now.
    let past = RetryAfter::At(now - chrono::Duration::hours(1));
    assert_eq!(past.instant(now), now);
  }

  #[test]
  fn test_failure_kinds() {
    let err = WorkflowError::NonDeterminism {
      position: 0,
      expected: "a".to_string(),
      found: "b".to_string(),
    };
    assert_eq!(err.failure_kind(), FailureKind::NonDeterminism);
    assert_eq!(
      WorkflowError::failed("nope").failure_kind(),
      FailureKind::Fatal
    );
    assert!(StepError::other("flaky").is_retryable());
    assert!(!StepError::fatal("bad card").is_retryable());
  }
}
