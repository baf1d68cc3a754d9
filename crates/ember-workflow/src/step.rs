//! Step execution context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ember_world::WebhookResponse;
use serde::Serialize;

use crate::error::StepError;

/// Side effects a running step may record in its run's log.
///
/// Implemented by the engine; steps reach it only through [`StepContext`].
#[async_trait]
pub trait StepEffects: Send + Sync {
  /// Append a chunk to an output stream, returning its index.
  async fn write_chunk(
    &self,
    run_id: &str,
    namespace: &str,
    chunk: serde_json::Value,
  ) -> Result<u64, StepError>;

  /// Mark an output stream as finished.
  async fn close_stream(&self, run_id: &str, namespace: &str) -> Result<(), StepError>;

  /// Record the HTTP response for a delivered webhook request.
  async fn respond(
    &self,
    run_id: &str,
    request_id: &str,
    response: WebhookResponse,
  ) -> Result<(), StepError>;
}

/// Context handed to every step attempt.
///
/// Exposes run metadata and effect handles. It has no way to sleep or
/// create hooks; only orchestrators can suspend a run.
pub struct StepContext {
  run_id: String,
  step_id: String,
  step: String,
  attempt: u32,
  responds_to: Option<String>,
  responded: AtomicBool,
  effects: Arc<dyn StepEffects>,
}

impl StepContext {
  pub fn new(
    run_id: impl Into<String>,
    step_id: impl Into<String>,
    step: impl Into<String>,
    attempt: u32,
    responds_to: Option<String>,
    effects: Arc<dyn StepEffects>,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      step_id: step_id.into(),
      step: step.into(),
      attempt,
      responds_to,
      responded: AtomicBool::new(false),
      effects,
    }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  /// Stable identity of this invocation. Retries reuse it.
  pub fn step_id(&self) -> &str {
    &self.step_id
  }

  pub fn step_name(&self) -> &str {
    &self.step
  }

  /// Attempt number, starting at 1.
  pub fn attempt(&self) -> u32 {
    self.attempt
  }

  /// Key for external APIs that deduplicate requests ("charge once").
  /// Identical across every attempt of this invocation.
  pub fn idempotency_key(&self) -> String {
    format!("{}:{}", self.run_id, self.step_id)
  }

  /// Writer for the output stream `namespace`.
  pub fn stream(&self, namespace: impl Into<String>) -> StreamWriter {
    StreamWriter {
      run_id: self.run_id.clone(),
      namespace: namespace.into(),
      effects: self.effects.clone(),
    }
  }

  /// Webhook request this step must answer, if any.
  pub fn request_id(&self) -> Option<&str> {
    self.responds_to.as_deref()
  }

  /// Answer the webhook request this step handles.
  pub async fn respond(&self, response: WebhookResponse) -> Result<(), StepError> {
    let Some(request_id) = &self.responds_to else {
      return Err(StepError::fatal(format!(
        "step '{}' is not handling a webhook request",
        self.step
      )));
    };
    self
      .effects
      .respond(&self.run_id, request_id, response)
      .await?;
    self.responded.store(true, Ordering::SeqCst);
    Ok(())
  }

  /// Whether `respond` succeeded during this attempt.
  pub fn responded(&self) -> bool {
    self.responded.load(Ordering::SeqCst)
  }
}

/// Appends chunks to one output stream of a run.
#[derive(Clone)]
pub struct StreamWriter {
  run_id: String,
  namespace: String,
  effects: Arc<dyn StepEffects>,
}

impl StreamWriter {
  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  /// Append a chunk, returning the index it was stored at.
  pub async fn write<T: Serialize>(&self, chunk: &T) -> Result<u64, StepError> {
    let chunk = serde_json::to_value(chunk)?;
    self
      .effects
      .write_chunk(&self.run_id, &self.namespace, chunk)
      .await
  }

  /// Close the stream. Readers drain what was written and then end.
  pub async fn close(self) -> Result<(), StepError> {
    self
      .effects
      .close_stream(&self.run_id, &self.namespace)
      .await
  }
}
