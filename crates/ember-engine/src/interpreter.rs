//! Drives orchestrators forward against their event log.

use ember_workflow::{Blocked, Call, History, Outcome, PendingCall, WorkflowError, replay};
use ember_world::{
  Appended, EventKind, FailureKind, QueueMessage, RunFailure, RunStatus, StepDiagnostics,
  TokenKind, TokenRecord,
};
use tracing::{error, info, instrument, warn};

use crate::engine::Engine;
use crate::error::EngineError;

/// Result of one advance of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
  /// New steps were dispatched; the run is making progress.
  Continue,
  /// Nothing to do until one of these resolves.
  Suspend(Vec<Blocked>),
  Complete(serde_json::Value),
  Fail(RunFailure),
}

enum Issued {
  Waiting(Blocked),
  Conflict,
  /// The run reached a terminal event while the call was being issued.
  Finished,
}

impl Engine {
  /// Append `incoming` (if any) and run the orchestrator against the log.
  ///
  /// Advances of one run never overlap.
  #[instrument(name = "run_advance", skip(self, incoming), fields(run_id = %run_id))]
  pub async fn advance(
    &self,
    run_id: &str,
    incoming: Option<EventKind>,
  ) -> Result<Advance, EngineError> {
    let lock = self.run_lock(run_id);
    let _guard = lock.lock().await;

    if let Some(kind) = incoming {
      self.append(run_id, kind).await?;
    }

    let mut rearmed = false;
    loop {
      let history = self.history(run_id).await?;
      if let Some(advance) = terminal_advance(&history) {
        return Ok(advance);
      }
      if !rearmed {
        self.rearm(run_id, &history).await?;
        rearmed = true;
      }

      let run = self.inner.world.get_run(run_id).await?;
      let Some(workflow) = self.inner.registry.get_workflow(&run.workflow) else {
        error!(run_id = %run_id, workflow = %run.workflow, "workflow_not_registered");
        let failure = RunFailure {
          kind: FailureKind::Fatal,
          message: format!("workflow '{}' is not registered", run.workflow),
          step: None,
        };
        return self.finalize(run_id, EventKind::RunFailed { failure }).await;
      };

      let outcome = replay(workflow.as_ref(), run_id, history.clone(), self.now());
      match outcome {
        Outcome::Completed(output) => {
          return self.finalize(run_id, EventKind::RunCompleted { output }).await;
        }
        Outcome::Failed(err) => {
          let failure = run_failure(&history, &err);
          if err.failure_kind() == FailureKind::NonDeterminism {
            error!(run_id = %run_id, error = %err, "replay_diverged");
          }
          return self.finalize(run_id, EventKind::RunFailed { failure }).await;
        }
        Outcome::Suspended(blocked) => {
          self.set_status(run_id, status_for(&blocked)).await?;
          return Ok(Advance::Suspend(blocked));
        }
        Outcome::Issue { calls, mut blocked } => {
          let mut dispatched = false;
          let mut replay_again = false;
          for call in calls {
            dispatched |= matches!(call, PendingCall::Step { .. });
            match self.issue(run_id, call).await? {
              Issued::Waiting(reason) => {
                if !blocked.contains(&reason) {
                  blocked.push(reason);
                }
              }
              Issued::Conflict | Issued::Finished => {
                replay_again = true;
                break;
              }
            }
          }
          if replay_again {
            // The log changed under this advance; replay so the orchestrator sees it.
            continue;
          }

          self.set_status(run_id, status_for(&blocked)).await?;
          if dispatched {
            return Ok(Advance::Continue);
          }
          return Ok(Advance::Suspend(blocked));
        }
      }
    }
  }

  /// Queue again whatever recorded steps and sleeps are waiting on.
  ///
  /// A call's event and its queue message are separate writes, so a failure
  /// between them leaves the call recorded with nothing to move it along.
  /// The queue coalesces messages that are already waiting.
  async fn rearm(&self, run_id: &str, history: &History) -> Result<(), EngineError> {
    for (position, call) in history.calls() {
      match call {
        Call::Step(step)
          if step.outcome.is_none() && history.started_attempts(&step.step_id) == 0 =>
        {
          self
            .enqueue(
              QueueMessage::Step {
                run_id: run_id.to_string(),
                step_id: step.step_id.clone(),
                attempt: 1,
              },
              self.now(),
            )
            .await?;
        }
        Call::Sleep(sleep) if !sleep.elapsed => {
          self
            .inner
            .world
            .schedule_wake(run_id, position, sleep.wake_at)
            .await?;
        }
        _ => {}
      }
    }
    Ok(())
  }

  /// Persist one new call and arrange for it to make progress.
  async fn issue(&self, run_id: &str, call: PendingCall) -> Result<Issued, EngineError> {
    match call {
      PendingCall::Step {
        position,
        step_id,
        step,
        args,
        max_retries,
        responds_to,
      } => {
        let appended = self
          .append(
            run_id,
            EventKind::StepScheduled {
              position,
              step_id: step_id.clone(),
              step: step.clone(),
              args,
              max_retries,
              responds_to,
            },
          )
          .await?;
        if appended.is_new() {
          self
            .enqueue(
              QueueMessage::Step {
                run_id: run_id.to_string(),
                step_id: step_id.clone(),
                attempt: 1,
              },
              self.now(),
            )
            .await?;
          info!(run_id = %run_id, step_id = %step_id, step = %step, "step_scheduled");
        }
        Ok(Issued::Waiting(Blocked::Step { step_id }))
      }
      PendingCall::Sleep { position, wake_at } => {
        let appended = self
          .append(run_id, EventKind::SleepScheduled { position, wake_at })
          .await?;
        if appended.is_new() {
          self
            .inner
            .world
            .schedule_wake(run_id, position, wake_at)
            .await?;
          self.inner.wakeup.notify_one();
          info!(run_id = %run_id, position, wake_at = %wake_at, "sleep_scheduled");
        }
        Ok(Issued::Waiting(Blocked::Sleep { position, wake_at }))
      }
      PendingCall::Hook {
        position,
        token,
        multi_shot,
        schema,
        metadata,
      } => {
        let record = TokenRecord {
          token: token.clone(),
          run_id: run_id.to_string(),
          position,
          kind: TokenKind::Hook,
          multi_shot,
          schema: schema.clone(),
          response: None,
          consumed: false,
          created_at: self.now(),
        };
        if self.history(run_id).await?.is_terminal() {
          return Ok(Issued::Finished);
        }
        if !self.register_token(&record).await? {
          self.record_conflict(run_id, position, token).await?;
          return Ok(Issued::Conflict);
        }
        self
          .append(
            run_id,
            EventKind::HookCreated {
              position,
              token: token.clone(),
              multi_shot,
              schema,
              metadata,
            },
          )
          .await?;
        if self.release_if_finished(run_id).await? {
          return Ok(Issued::Finished);
        }
        info!(run_id = %run_id, token = %token, multi_shot, "hook_created");
        Ok(Issued::Waiting(Blocked::Hook { token }))
      }
      PendingCall::Webhook {
        position,
        token,
        multi_shot,
        response,
      } => {
        let record = TokenRecord {
          token: token.clone(),
          run_id: run_id.to_string(),
          position,
          kind: TokenKind::Webhook,
          multi_shot,
          schema: None,
          response: Some(response.clone()),
          consumed: false,
          created_at: self.now(),
        };
        if self.history(run_id).await?.is_terminal() {
          return Ok(Issued::Finished);
        }
        if !self.register_token(&record).await? {
          self.record_conflict(run_id, position, token).await?;
          return Ok(Issued::Conflict);
        }
        self
          .append(
            run_id,
            EventKind::WebhookCreated {
              position,
              token: token.clone(),
              multi_shot,
              response,
            },
          )
          .await?;
        if self.release_if_finished(run_id).await? {
          return Ok(Issued::Finished);
        }
        info!(run_id = %run_id, token = %token, multi_shot, "webhook_created");
        Ok(Issued::Waiting(Blocked::Webhook { token }))
      }
    }
  }

  /// Drop the run's tokens if it finished while one was being registered.
  ///
  /// A terminal event appended elsewhere before this check releases tokens
  /// after it, so a token registered here can never outlive the run.
  async fn release_if_finished(&self, run_id: &str) -> Result<bool, EngineError> {
    if !self.history(run_id).await?.is_terminal() {
      return Ok(false);
    }
    warn!(run_id = %run_id, "token_registered_after_finish");
    self.inner.world.release_tokens(run_id).await?;
    Ok(true)
  }

  async fn record_conflict(
    &self,
    run_id: &str,
    position: u32,
    token: String,
  ) -> Result<(), EngineError> {
    self
      .append(run_id, EventKind::HookConflict { position, token })
      .await?;
    Ok(())
  }

  /// Append a terminal event and bring the run projection in line with the
  /// log. If another terminal event won the race, that one is reported.
  pub(crate) async fn finalize(
    &self,
    run_id: &str,
    kind: EventKind,
  ) -> Result<Advance, EngineError> {
    let appended = self.append(run_id, kind).await?;
    if appended == Appended::Duplicate {
      warn!(run_id = %run_id, "terminal_event_already_recorded");
    }

    let history = self.history(run_id).await?;
    let Some(advance) = terminal_advance(&history) else {
      return Err(EngineError::RunNotFound {
        run_id: run_id.to_string(),
      });
    };

    let mut run = self.inner.world.get_run(run_id).await?;
    let now = self.now();
    match &advance {
      Advance::Complete(output) => {
        run.status = RunStatus::Completed;
        run.output = Some(output.clone());
      }
      Advance::Fail(failure) => {
        run.status = if history.is_cancelled() {
          RunStatus::Cancelled
        } else {
          RunStatus::Failed
        };
        run.failure = Some(failure.clone());
      }
      Advance::Continue | Advance::Suspend(_) => {}
    }
    run.updated_at = now;
    run.completed_at.get_or_insert(now);
    self.inner.world.update_run(&run).await?;
    self.inner.world.release_tokens(run_id).await?;

    info!(run_id = %run_id, status = %run.status, "run_finished");
    Ok(advance)
  }
}

/// The outcome of a run whose log already holds a terminal event.
pub(crate) fn terminal_advance(history: &History) -> Option<Advance> {
  if let Some(output) = history.output() {
    return Some(Advance::Complete(output.clone()));
  }
  if let Some(failure) = history.failure() {
    return Some(Advance::Fail(failure.clone()));
  }
  if history.is_cancelled() {
    return Some(Advance::Fail(RunFailure {
      kind: FailureKind::Cancelled,
      message: history
        .cancel_reason()
        .map_or_else(|| "run cancelled".to_string(), |r| format!("run cancelled: {r}")),
      step: None,
    }));
  }
  None
}

/// Runs waiting only on steps are still running; anything else is suspended.
fn status_for(blocked: &[Blocked]) -> RunStatus {
  if blocked.iter().any(|b| matches!(b, Blocked::Step { .. })) {
    RunStatus::Running
  } else {
    RunStatus::Suspended
  }
}

fn run_failure(history: &History, err: &WorkflowError) -> RunFailure {
  let step = match err {
    WorkflowError::StepFailed { step, step_id, .. } => Some(StepDiagnostics {
      step_id: step_id.clone(),
      step: step.clone(),
      attempts: history.attempts(step_id).to_vec(),
    }),
    _ => None,
  };
  RunFailure {
    kind: err.failure_kind(),
    message: err.to_string(),
    step,
  }
}
