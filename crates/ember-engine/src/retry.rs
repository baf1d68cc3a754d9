use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff for steps that fail without a classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Delay before the first retry, in milliseconds.
  pub base_delay_ms: u64,
  /// Upper bound on any single delay, in milliseconds.
  pub max_delay_ms: u64,
  /// Growth factor between consecutive delays.
  pub multiplier: f64,
  /// Fraction of the delay randomised in either direction (0.0 to 1.0).
  pub jitter: f64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
      multiplier: 2.0,
      jitter: 0.0,
    }
  }
}

impl RetryPolicy {
  /// No delay between attempts.
  pub fn immediate() -> Self {
    Self {
      base_delay_ms: 0,
      max_delay_ms: 0,
      ..Self::default()
    }
  }

  pub fn with_jitter(mut self, jitter: f64) -> Self {
    self.jitter = jitter.clamp(0.0, 1.0);
    self
  }

  /// Delay after failed attempt `attempt` (1-based).
  pub fn delay(&self, attempt: u32) -> chrono::Duration {
    let capped = self.base_delay(attempt);
    let jitter = self.jitter.clamp(0.0, 1.0);
    let factor = if jitter == 0.0 {
      1.0
    } else {
      1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    };
    chrono::Duration::milliseconds(to_millis(capped * factor))
  }

  fn base_delay(&self, attempt: u32) -> f64 {
    const MAX_EXP: i32 = 30;
    let exp = i32::try_from(attempt.saturating_sub(1)).map_or(MAX_EXP, |e| e.min(MAX_EXP));
    let delay = self.base_delay_ms as f64 * self.multiplier.powi(exp);
    delay.min(self.max_delay_ms as f64)
  }
}

fn to_millis(value: f64) -> i64 {
  if !value.is_finite() || value <= 0.0 {
    0
  } else if value >= u32::MAX as f64 {
    u32::MAX as i64
  } else {
    value as i64
  }
}
