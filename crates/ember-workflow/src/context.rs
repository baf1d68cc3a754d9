//! Deterministic replay context for orchestrators.
//!
//! Every suspension call an orchestrator makes (step, sleep, hook, webhook)
//! takes the next position from a counter. If the history holds a record at
//! that position, the call is answered from it without side effects. If not,
//! the call is new progress: it is queued as a [`PendingCall`] for the engine
//! to persist and the caller gets [`WorkflowError::Suspended`].
//!
//! Calls issued before the orchestrator propagates the first `Suspended` form
//! a parallel fan-out: the engine issues all of them in one advance.

use std::collections::HashMap;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use ember_world::{ResponseMode, WebhookRequest};
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::WorkflowError;
use crate::history::{Call, History, StepOutcome};
use crate::registry::Step;

/// Options for a single step call.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
  /// Overrides the step's `MAX_RETRIES` for this call.
  pub max_retries: Option<u32>,
}

/// Options for [`WorkflowContext::create_hook`].
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
  /// Caller-chosen token. A random token is generated when absent.
  pub token: Option<String>,
  /// Accept an unbounded sequence of resumes instead of one.
  pub multi_shot: bool,
  pub metadata: serde_json::Value,
}

impl HookOptions {
  pub fn token(token: impl Into<String>) -> Self {
    Self {
      token: Some(token.into()),
      ..Self::default()
    }
  }

  pub fn multi_shot(mut self) -> Self {
    self.multi_shot = true;
    self
  }

  pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
    self.metadata = metadata;
    self
  }
}

/// Options for [`WorkflowContext::create_webhook`].
#[derive(Debug, Clone, Default)]
pub struct WebhookOptions {
  pub token: Option<String>,
  pub multi_shot: bool,
  /// How delivered requests are answered.
  pub response: ResponseMode,
}

impl WebhookOptions {
  pub fn token(token: impl Into<String>) -> Self {
    Self {
      token: Some(token.into()),
      ..Self::default()
    }
  }

  pub fn multi_shot(mut self) -> Self {
    self.multi_shot = true;
    self
  }

  /// Require a handler step to answer each request via `respond_with`.
  pub fn manual(mut self) -> Self {
    self.response = ResponseMode::Manual;
    self
  }
}

/// Handle to a hook created by the orchestrator.
pub struct Hook<T> {
  position: u32,
  token: String,
  _payload: PhantomData<fn() -> T>,
}

impl<T> Hook<T> {
  pub fn token(&self) -> &str {
    &self.token
  }
}

impl<T> Clone for Hook<T> {
  fn clone(&self) -> Self {
    Self {
      position: self.position,
      token: self.token.clone(),
      _payload: PhantomData,
    }
  }
}

impl<T> std::fmt::Debug for Hook<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Hook")
      .field("position", &self.position)
      .field("token", &self.token)
      .finish()
  }
}

/// Handle to a webhook created by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
  position: u32,
  token: String,
}

impl Webhook {
  pub fn token(&self) -> &str {
    &self.token
  }
}

/// A call with no recorded issuance, to be persisted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingCall {
  Step {
    position: u32,
    step_id: String,
    step: String,
    args: serde_json::Value,
    max_retries: u32,
    responds_to: Option<String>,
  },
  Sleep {
    position: u32,
    wake_at: DateTime<Utc>,
  },
  Hook {
    position: u32,
    token: String,
    multi_shot: bool,
    schema: Option<serde_json::Value>,
    metadata: serde_json::Value,
  },
  Webhook {
    position: u32,
    token: String,
    multi_shot: bool,
    response: ResponseMode,
  },
}

impl PendingCall {
  pub fn position(&self) -> u32 {
    match self {
      PendingCall::Step { position, .. }
      | PendingCall::Sleep { position, .. }
      | PendingCall::Hook { position, .. }
      | PendingCall::Webhook { position, .. } => *position,
    }
  }
}

/// Why a run cannot make progress.
#[derive(Debug, Clone, PartialEq)]
pub enum Blocked {
  /// A step is scheduled and has no outcome yet.
  Step { step_id: String },
  Sleep {
    position: u32,
    wake_at: DateTime<Utc>,
  },
  Hook { token: String },
  Webhook { token: String },
}

/// Result of running an orchestrator once against its history.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// New calls to persist, in position order.
  Issue {
    calls: Vec<PendingCall>,
    blocked: Vec<Blocked>,
  },
  /// Waiting on recorded calls that have not resolved.
  Suspended(Vec<Blocked>),
  Completed(serde_json::Value),
  Failed(WorkflowError),
}

/// The orchestrator's only window on the outside world.
pub struct WorkflowContext {
  run_id: String,
  now: DateTime<Utc>,
  history: History,
  next_position: u32,
  pending: Vec<PendingCall>,
  blocked: Vec<Blocked>,
  violation: Option<WorkflowError>,
  waits: HashMap<u32, usize>,
}

impl WorkflowContext {
  /// Create a context over `history`. `now` is used only to compute the
  /// wake instant of sleeps issued during this advance.
  pub fn new(run_id: impl Into<String>, history: History, now: DateTime<Utc>) -> Self {
    Self {
      run_id: run_id.into(),
      now,
      history,
      next_position: 0,
      pending: Vec::new(),
      blocked: Vec::new(),
      violation: None,
      waits: HashMap::new(),
    }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }

  pub fn history(&self) -> &History {
    &self.history
  }

  /// Call a step with its default retry budget.
  pub fn step<S: Step>(&mut self, input: &S::Input) -> Result<S::Output, WorkflowError> {
    self.step_with::<S>(input, StepOptions::default())
  }

  /// Call a step.
  pub fn step_with<S: Step>(
    &mut self,
    input: &S::Input,
    options: StepOptions,
  ) -> Result<S::Output, WorkflowError> {
    let max_retries = options.max_retries.unwrap_or(S::MAX_RETRIES);
    let result = self.call_step(S::NAME, input, max_retries, None)?;
    serde_json::from_value(result).map_err(|e| self.fatal(e.into()))
  }

  /// Run `S` as the handler of a webhook request. The step must answer the
  /// request with `StepContext::respond` or it fails with `ResponseNotSent`.
  pub fn respond_with<S: Step>(
    &mut self,
    request: &WebhookRequest,
    input: &S::Input,
  ) -> Result<S::Output, WorkflowError> {
    self.respond_with_options::<S>(request, input, StepOptions::default())
  }

  /// [`respond_with`](Self::respond_with) with per-call options.
  pub fn respond_with_options<S: Step>(
    &mut self,
    request: &WebhookRequest,
    input: &S::Input,
    options: StepOptions,
  ) -> Result<S::Output, WorkflowError> {
    let max_retries = options.max_retries.unwrap_or(S::MAX_RETRIES);
    let result = self.call_step(
      S::NAME,
      input,
      max_retries,
      Some(request.request_id.clone()),
    )?;
    serde_json::from_value(result).map_err(|e| self.fatal(e.into()))
  }

  fn call_step<I: Serialize>(
    &mut self,
    step: &str,
    input: &I,
    max_retries: u32,
    responds_to: Option<String>,
  ) -> Result<serde_json::Value, WorkflowError> {
    self.check()?;
    let position = self.take_position();
    let args = serde_json::to_value(input).map_err(|e| self.fatal(e.into()))?;
    let step_id = format!("{position}:{step}");

    match self.history.call(position) {
      Some(Call::Step(recorded)) if recorded.step == step && recorded.args == args => {
        match &recorded.outcome {
          Some(StepOutcome::Completed(value)) => Ok(value.clone()),
          Some(StepOutcome::Failed(failure)) => Err(WorkflowError::StepFailed {
            step: step.to_string(),
            step_id,
            kind: failure.kind,
            message: failure.message.clone(),
          }),
          None => {
            self.blocked.push(Blocked::Step { step_id });
            Err(WorkflowError::Suspended)
          }
        }
      }
      Some(recorded) => {
        let expected = recorded.describe();
        Err(self.diverged(position, expected, format!("step '{step}' with args {args}")))
      }
      None => {
        self.pending.push(PendingCall::Step {
          position,
          step_id,
          step: step.to_string(),
          args,
          max_retries,
          responds_to,
        });
        Err(WorkflowError::Suspended)
      }
    }
  }

  /// Suspend the run for `duration`.
  pub fn sleep(&mut self, duration: chrono::Duration) -> Result<(), WorkflowError> {
    let wake_at = self
      .now
      .checked_add_signed(duration)
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    self.sleep_until(wake_at)
  }

  /// Suspend the run until `wake_at`.
  pub fn sleep_until(&mut self, wake_at: DateTime<Utc>) -> Result<(), WorkflowError> {
    self.check()?;
    let position = self.take_position();

    match self.history.call(position) {
      Some(Call::Sleep(sleep)) => {
        if sleep.elapsed {
          Ok(())
        } else {
          self.blocked.push(Blocked::Sleep {
            position,
            wake_at: sleep.wake_at,
          });
          Err(WorkflowError::Suspended)
        }
      }
      Some(recorded) => {
        let expected = recorded.describe();
        Err(self.diverged(position, expected, "sleep".to_string()))
      }
      None => {
        self.pending.push(PendingCall::Sleep { position, wake_at });
        Err(WorkflowError::Suspended)
      }
    }
  }

  /// Create a hook whose payloads deserialize to `T`.
  ///
  /// Returns immediately; waiting happens in [`next_payload`](Self::next_payload).
  /// Resumes are validated against the JSON Schema of `T`.
  pub fn create_hook<T: DeserializeOwned + JsonSchema>(
    &mut self,
    options: HookOptions,
  ) -> Result<Hook<T>, WorkflowError> {
    self.check()?;
    let position = self.take_position();

    let token = match self.history.call(position) {
      Some(Call::Hook(hook)) if options.token.as_ref().is_none_or(|t| *t == hook.token) => {
        hook.token.clone()
      }
      Some(Call::Conflict { token }) if options.token.as_ref().is_none_or(|t| t == token) => {
        return Err(WorkflowError::TokenConflict {
          token: token.clone(),
        });
      }
      Some(recorded) => {
        let expected = recorded.describe();
        let found = format!("hook '{}'", options.token.unwrap_or_default());
        return Err(self.diverged(position, expected, found));
      }
      None => {
        let token = options
          .token
          .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let schema = serde_json::to_value(schemars::schema_for!(T))
          .map_err(|e| self.fatal(e.into()))?;
        debug!(run_id = %self.run_id, position, token = %token, "hook_issued");
        self.pending.push(PendingCall::Hook {
          position,
          token: token.clone(),
          multi_shot: options.multi_shot,
          schema: Some(schema),
          metadata: options.metadata,
        });
        token
      }
    };

    Ok(Hook {
      position,
      token,
      _payload: PhantomData,
    })
  }

  /// Wait for the hook's next payload.
  ///
  /// The n-th call for a handle yields the n-th resume delivered to it.
  pub fn next_payload<T: DeserializeOwned>(&mut self, hook: &Hook<T>) -> Result<T, WorkflowError> {
    self.check()?;
    let index = self.take_wait(hook.position);

    let payload = match self.history.call(hook.position) {
      Some(Call::Hook(recorded)) => recorded.resumes.get(index).cloned(),
      _ => None,
    };
    match payload {
      Some(payload) => serde_json::from_value(payload).map_err(|e| self.fatal(e.into())),
      None => {
        self.blocked.push(Blocked::Hook {
          token: hook.token.clone(),
        });
        Err(WorkflowError::Suspended)
      }
    }
  }

  /// Create a webhook. Returns immediately; see [`next_request`](Self::next_request).
  pub fn create_webhook(&mut self, options: WebhookOptions) -> Result<Webhook, WorkflowError> {
    self.check()?;
    let position = self.take_position();

    let token = match self.history.call(position) {
      Some(Call::Webhook(webhook))
        if options.token.as_ref().is_none_or(|t| *t == webhook.token) =>
      {
        webhook.token.clone()
      }
      Some(Call::Conflict { token }) if options.token.as_ref().is_none_or(|t| t == token) => {
        return Err(WorkflowError::TokenConflict {
          token: token.clone(),
        });
      }
      Some(recorded) => {
        let expected = recorded.describe();
        let found = format!("webhook '{}'", options.token.unwrap_or_default());
        return Err(self.diverged(position, expected, found));
      }
      None => {
        let token = options
          .token
          .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.pending.push(PendingCall::Webhook {
          position,
          token: token.clone(),
          multi_shot: options.multi_shot,
          response: options.response,
        });
        token
      }
    };

    Ok(Webhook { position, token })
  }

  /// Wait for the webhook's next request.
  pub fn next_request(&mut self, webhook: &Webhook) -> Result<WebhookRequest, WorkflowError> {
    self.check()?;
    let index = self.take_wait(webhook.position);

    let request = match self.history.call(webhook.position) {
      Some(Call::Webhook(recorded)) => recorded.requests.get(index).cloned(),
      _ => None,
    };
    request.ok_or_else(|| {
      self.blocked.push(Blocked::Webhook {
        token: webhook.token.clone(),
      });
      WorkflowError::Suspended
    })
  }

  /// Consume the context into the outcome of this advance.
  pub fn finish(self, result: Result<serde_json::Value, WorkflowError>) -> Outcome {
    if let Some(violation) = self.violation {
      return Outcome::Failed(violation);
    }
    match result {
      Ok(output) => Outcome::Completed(output),
      Err(WorkflowError::Suspended) if !self.pending.is_empty() => Outcome::Issue {
        calls: self.pending,
        blocked: self.blocked,
      },
      Err(WorkflowError::Suspended) if !self.blocked.is_empty() => {
        Outcome::Suspended(self.blocked)
      }
      Err(WorkflowError::Suspended) => Outcome::Failed(WorkflowError::failed(
        "orchestrator suspended without waiting on any call",
      )),
      Err(err) => Outcome::Failed(err),
    }
  }

  fn take_position(&mut self) -> u32 {
    let position = self.next_position;
    self.next_position += 1;
    position
  }

  fn take_wait(&mut self, position: u32) -> usize {
    let waits = self.waits.entry(position).or_default();
    let index = *waits;
    *waits += 1;
    index
  }

  /// Fail every call once replay has diverged.
  fn check(&self) -> Result<(), WorkflowError> {
    match &self.violation {
      Some(violation) => Err(violation.clone()),
      None => Ok(()),
    }
  }

  /// Record a failure the orchestrator cannot recover from.
  fn fatal(&mut self, err: WorkflowError) -> WorkflowError {
    if self.violation.is_none() {
      self.violation = Some(err.clone());
    }
    err
  }

  fn diverged(&mut self, position: u32, expected: String, found: String) -> WorkflowError {
    self.fatal(WorkflowError::NonDeterminism {
      position,
      expected,
      found,
    })
  }
}
