//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Tunables for an [`Engine`](crate::Engine).
///
/// Every field has a default, so partial JSON documents deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Backoff for unclassified step failures.
  pub retry: RetryPolicy,
  /// How long a claimed queue message stays invisible before redelivery.
  pub lease_ms: u64,
  /// Upper bound on how long the runner idles between queue polls.
  pub poll_interval_ms: u64,
  /// Step attempts the runner executes at once.
  pub max_concurrent_steps: usize,
  /// How long `resume_webhook` waits for a manual response.
  pub webhook_response_timeout_ms: u64,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      retry: RetryPolicy::default(),
      lease_ms: 30_000,
      poll_interval_ms: 1_000,
      max_concurrent_steps: 16,
      webhook_response_timeout_ms: 30_000,
    }
  }
}

impl EngineConfig {
  pub fn lease(&self) -> chrono::Duration {
    chrono::Duration::milliseconds(self.lease_ms as i64)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn webhook_response_timeout(&self) -> Duration {
    Duration::from_millis(self.webhook_response_timeout_ms)
  }
}
