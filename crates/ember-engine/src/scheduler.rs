//! Step attempt execution and retry scheduling.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use ember_workflow::{StepContext, StepEffects, StepError};
use ember_world::{Appended, EventKind, FailureKind, QueueMessage, StepFailure, WebhookResponse};
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;

impl Engine {
  /// Run one attempt of a scheduled step and record what happened.
  ///
  /// Delivery is at-least-once: a redelivered attempt whose outcome is
  /// already recorded is skipped, one that never finished runs again.
  #[instrument(name = "step_attempt", skip(self), fields(run_id = %run_id, step_id = %step_id))]
  pub(crate) async fn run_step(
    &self,
    run_id: &str,
    step_id: &str,
    attempt: u32,
  ) -> Result<(), EngineError> {
    let history = self.history(run_id).await?;
    if history.is_terminal() {
      debug!(run_id = %run_id, step_id = %step_id, "step_skipped_run_finished");
      return Ok(());
    }
    let Some(call) = history.step(step_id) else {
      warn!(run_id = %run_id, step_id = %step_id, "step_not_scheduled");
      return Ok(());
    };
    if call.outcome.is_some() {
      // The delivery that recorded it may have died before queueing the advance.
      debug!(run_id = %run_id, step_id = %step_id, attempt, "step_outcome_already_recorded");
      return self.trigger(run_id).await;
    }
    let failed = history
      .attempts(step_id)
      .iter()
      .map(|a| a.attempt)
      .filter(|a| *a >= attempt)
      .max();
    if let Some(failed) = failed {
      debug!(run_id = %run_id, step_id = %step_id, attempt, "step_attempt_already_recorded");
      if history.started_attempts(step_id) <= failed
        && let Some(retry_at) = history.retry_at(step_id, failed)
      {
        self
          .enqueue(
            QueueMessage::Step {
              run_id: run_id.to_string(),
              step_id: step_id.to_string(),
              attempt: failed + 1,
            },
            retry_at,
          )
          .await?;
      }
      return Ok(());
    }
    if let Some(started_at) = history.started_at(step_id, attempt) {
      let expires = started_at + self.inner.config.lease();
      if self.now() < expires {
        // Another delivery may still be running it; look again once its lease is up.
        debug!(run_id = %run_id, step_id = %step_id, attempt, "step_attempt_in_flight");
        return self
          .enqueue(
            QueueMessage::Step {
              run_id: run_id.to_string(),
              step_id: step_id.to_string(),
              attempt,
            },
            expires,
          )
          .await;
      }
    }
    let call = call.clone();

    let started = self
      .append(
        run_id,
        EventKind::StepStarted {
          step_id: step_id.to_string(),
          attempt,
        },
      )
      .await?;
    if started == Appended::Duplicate {
      // A previous delivery of this attempt died mid-flight.
      info!(run_id = %run_id, step_id = %step_id, attempt, "step_attempt_redelivered");
    }

    let Some(step) = self.inner.registry.get_step(&call.step) else {
      warn!(run_id = %run_id, step = %call.step, "step_not_registered");
      let failure = StepFailure {
        kind: FailureKind::Fatal,
        message: format!("step '{}' is not registered", call.step),
      };
      return self.fail_step(run_id, step_id, attempt, failure).await;
    };

    let effects: Arc<dyn StepEffects> = Arc::new(EngineEffects {
      engine: self.clone(),
    });
    let ctx = StepContext::new(
      run_id,
      step_id,
      &call.step,
      attempt,
      call.responds_to.clone(),
      effects,
    );
    let result = AssertUnwindSafe(step.run(&ctx, call.args.clone()))
      .catch_unwind()
      .await
      .unwrap_or_else(|panic| Err(StepError::other(panic_message(panic.as_ref()))));

    if self.history(run_id).await?.is_terminal() {
      info!(run_id = %run_id, step_id = %step_id, "step_result_discarded");
      return Ok(());
    }

    match result {
      Ok(_) if call.responds_to.is_some() && !ctx.responded() => {
        let failure = StepFailure {
          kind: FailureKind::ResponseNotSent,
          message: format!("step '{}' finished without responding", call.step),
        };
        self.fail_step(run_id, step_id, attempt, failure).await
      }
      Ok(output) => {
        let appended = self
          .append(
            run_id,
            EventKind::StepCompleted {
              step_id: step_id.to_string(),
              attempt,
              result: output,
            },
          )
          .await?;
        if appended.is_new() {
          info!(run_id = %run_id, step_id = %step_id, attempt, "step_completed");
          self.trigger(run_id).await?;
        }
        Ok(())
      }
      Err(StepError::Fatal(message)) => {
        let failure = StepFailure {
          kind: FailureKind::Fatal,
          message,
        };
        self.fail_step(run_id, step_id, attempt, failure).await
      }
      Err(StepError::Serialization(message)) => {
        let failure = StepFailure {
          kind: FailureKind::Serialization,
          message,
        };
        self.fail_step(run_id, step_id, attempt, failure).await
      }
      Err(err) => {
        let message = err.to_string();
        if attempt > call.max_retries {
          warn!(run_id = %run_id, step_id = %step_id, attempt, error = %message, "step_retries_exhausted");
          let failure = StepFailure {
            kind: FailureKind::Exhausted,
            message,
          };
          return self.fail_step(run_id, step_id, attempt, failure).await;
        }

        let now = self.now();
        let retry_at = match &err {
          StepError::Retryable { retry_after, .. } => retry_after.instant(now),
          _ => now + self.inner.config.retry.delay(attempt),
        };
        let appended = self
          .append(
            run_id,
            EventKind::StepRetrying {
              step_id: step_id.to_string(),
              attempt,
              error: message.clone(),
              retry_at,
            },
          )
          .await?;
        if appended.is_new() {
          self
            .enqueue(
              QueueMessage::Step {
                run_id: run_id.to_string(),
                step_id: step_id.to_string(),
                attempt: attempt + 1,
              },
              retry_at,
            )
            .await?;
          warn!(run_id = %run_id, step_id = %step_id, attempt, retry_at = %retry_at, error = %message, "step_retrying");
        }
        Ok(())
      }
    }
  }

  async fn fail_step(
    &self,
    run_id: &str,
    step_id: &str,
    attempt: u32,
    failure: StepFailure,
  ) -> Result<(), EngineError> {
    let kind = failure.kind;
    let appended = self
      .append(
        run_id,
        EventKind::StepFailed {
          step_id: step_id.to_string(),
          attempt,
          failure,
        },
      )
      .await?;
    if appended.is_new() {
      warn!(run_id = %run_id, step_id = %step_id, attempt, kind = %kind, "step_failed");
      self.trigger(run_id).await?;
    }
    Ok(())
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    format!("step panicked: {s}")
  } else if let Some(s) = panic.downcast_ref::<String>() {
    format!("step panicked: {s}")
  } else {
    "step panicked".to_string()
  }
}

/// Records step side effects in the run's log.
struct EngineEffects {
  engine: Engine,
}

impl EngineEffects {
  fn unavailable(err: EngineError) -> StepError {
    StepError::other(err.to_string())
  }
}

#[async_trait]
impl StepEffects for EngineEffects {
  async fn write_chunk(
    &self,
    run_id: &str,
    namespace: &str,
    chunk: serde_json::Value,
  ) -> Result<u64, StepError> {
    let lock = self.engine.stream_lock(run_id);
    let _guard = lock.lock().await;
    loop {
      let history = self.engine.history(run_id).await.map_err(Self::unavailable)?;
      let stream = history.stream(namespace).cloned().unwrap_or_default();
      if stream.closed {
        return Err(StepError::fatal(format!("stream '{namespace}' is closed")));
      }
      let index = stream.next_index;
      let appended = self
        .engine
        .append(
          run_id,
          EventKind::StreamWrite {
            namespace: namespace.to_string(),
            index,
            chunk: chunk.clone(),
          },
        )
        .await
        .map_err(Self::unavailable)?;
      if appended.is_new() {
        return Ok(index);
      }
      // Another process took this index; read the log again.
    }
  }

  async fn close_stream(&self, run_id: &str, namespace: &str) -> Result<(), StepError> {
    self
      .engine
      .append(
        run_id,
        EventKind::StreamClosed {
          namespace: namespace.to_string(),
        },
      )
      .await
      .map_err(Self::unavailable)?;
    Ok(())
  }

  async fn respond(
    &self,
    run_id: &str,
    request_id: &str,
    response: WebhookResponse,
  ) -> Result<(), StepError> {
    let history = self.engine.history(run_id).await.map_err(Self::unavailable)?;
    let Some(token) = history.request_token(request_id) else {
      return Err(StepError::fatal(format!(
        "no webhook request '{request_id}' in this run"
      )));
    };
    let appended = self
      .engine
      .append(
        run_id,
        EventKind::WebhookResponded {
          token: token.to_string(),
          request_id: request_id.to_string(),
          response,
        },
      )
      .await
      .map_err(Self::unavailable)?;
    if appended.is_new() {
      debug!(run_id = %run_id, request_id = %request_id, "webhook_responded");
    } else {
      // An earlier attempt answered; the first response stands.
      debug!(run_id = %run_id, request_id = %request_id, "webhook_response_already_recorded");
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use chrono::Utc;
  use ember_workflow::Registry;
  use ember_world::{MemoryWorld, RunRecord, World};
  use serde_json::json;

  use super::*;

  #[tokio::test]
  async fn test_stream_writes_only_wait_on_their_own_run() {
    let world: Arc<dyn World> = Arc::new(MemoryWorld::new());
    for run_id in ["run_a", "run_b"] {
      let run = RunRecord::new(run_id, "narrate", serde_json::Value::Null, Utc::now());
      world.create_run(&run).await.unwrap();
    }
    let engine = Engine::new(world, Registry::new());
    let effects = EngineEffects {
      engine: engine.clone(),
    };

    let lock = engine.stream_lock("run_a");
    let _held = lock.lock().await;

    let index = tokio::time::timeout(
      Duration::from_secs(1),
      effects.write_chunk("run_b", "log", json!("x")),
    )
    .await
    .expect("write to run_b waited on run_a")
    .unwrap();
    assert_eq!(index, 0);

    let blocked = tokio::time::timeout(
      Duration::from_millis(50),
      effects.write_chunk("run_a", "log", json!("y")),
    )
    .await;
    assert!(blocked.is_err());
  }
}
