//! Indexed view of a run's event log.
//!
//! [`History`] folds events into per-position call records so replay can
//! answer "what happened at call N" in constant time. It is rebuilt from the
//! log on every advance and never persisted.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use ember_world::{
  AttemptRecord, Event, EventKind, ResponseMode, RunFailure, Seq, StepFailure, WebhookRequest,
  WebhookResponse,
};

/// Terminal result of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
  Completed(serde_json::Value),
  Failed(StepFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepCall {
  pub step_id: String,
  pub step: String,
  pub args: serde_json::Value,
  pub max_retries: u32,
  pub responds_to: Option<String>,
  pub outcome: Option<StepOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SleepCall {
  pub wake_at: DateTime<Utc>,
  pub elapsed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookCall {
  pub token: String,
  pub multi_shot: bool,
  pub schema: Option<serde_json::Value>,
  /// Payloads in delivery order.
  pub resumes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookCall {
  pub token: String,
  pub multi_shot: bool,
  pub response: ResponseMode,
  /// Requests in delivery order.
  pub requests: Vec<WebhookRequest>,
}

/// A recorded call site.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  Step(StepCall),
  Sleep(SleepCall),
  Hook(HookCall),
  Webhook(WebhookCall),
  /// Hook or webhook creation rejected because the token was in use.
  Conflict { token: String },
}

impl Call {
  /// Human readable identity used in non-determinism reports.
  pub fn describe(&self) -> String {
    match self {
      Call::Step(step) => format!("step '{}' with args {}", step.step, step.args),
      Call::Sleep(_) => "sleep".to_string(),
      Call::Hook(hook) => format!("hook '{}'", hook.token),
      Call::Webhook(webhook) => format!("webhook '{}'", webhook.token),
      Call::Conflict { token } => format!("hook '{token}'"),
    }
  }
}

/// State of an output stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
  /// Index the next chunk will receive.
  pub next_index: u64,
  pub closed: bool,
}

/// Indexed view of a run's events.
#[derive(Debug, Clone, Default)]
pub struct History {
  workflow: Option<String>,
  input: serde_json::Value,
  calls: BTreeMap<u32, Call>,
  steps: HashMap<String, u32>,
  attempts: HashMap<String, Vec<AttemptRecord>>,
  started: HashMap<String, u32>,
  retries: HashMap<(String, u32), DateTime<Utc>>,
  started_at: HashMap<(String, u32), DateTime<Utc>>,
  requests: HashMap<String, String>,
  responses: HashMap<String, WebhookResponse>,
  streams: HashMap<String, StreamState>,
  cancelled: Option<Option<String>>,
  completed: Option<serde_json::Value>,
  failed: Option<RunFailure>,
  last_seq: Seq,
}

impl History {
  pub fn from_events(events: &[Event]) -> Self {
    let mut history = Self::default();
    for event in events {
      history.apply(event);
    }
    history
  }

  /// Fold one event into the view.
  pub fn apply(&mut self, event: &Event) {
    self.last_seq = self.last_seq.max(event.seq);
    match &event.kind {
      EventKind::RunCreated { workflow, input } => {
        self.workflow = Some(workflow.clone());
        self.input = input.clone();
      }
      EventKind::StepScheduled {
        position,
        step_id,
        step,
        args,
        max_retries,
        responds_to,
      } => {
        self.steps.insert(step_id.clone(), *position);
        self.calls.insert(
          *position,
          Call::Step(StepCall {
            step_id: step_id.clone(),
            step: step.clone(),
            args: args.clone(),
            max_retries: *max_retries,
            responds_to: responds_to.clone(),
            outcome: None,
          }),
        );
      }
      EventKind::StepStarted { step_id, attempt } => {
        self
          .started_at
          .entry((step_id.clone(), *attempt))
          .or_insert(event.timestamp);
        let latest = self.started.entry(step_id.clone()).or_default();
        *latest = (*latest).max(*attempt);
      }
      EventKind::StepRetrying {
        step_id,
        attempt,
        error,
        retry_at,
      } => {
        self
          .retries
          .insert((step_id.clone(), *attempt), *retry_at);
        self
          .attempts
          .entry(step_id.clone())
          .or_default()
          .push(AttemptRecord {
            attempt: *attempt,
            error: error.clone(),
            at: event.timestamp,
          });
      }
      EventKind::StepCompleted {
        step_id, result, ..
      } => {
        if let Some(step) = self.step_call_mut(step_id) {
          step.outcome = Some(StepOutcome::Completed(result.clone()));
        }
      }
      EventKind::StepFailed {
        step_id,
        attempt,
        failure,
      } => {
        self
          .attempts
          .entry(step_id.clone())
          .or_default()
          .push(AttemptRecord {
            attempt: *attempt,
            error: failure.message.clone(),
            at: event.timestamp,
          });
        if let Some(step) = self.step_call_mut(step_id) {
          step.outcome = Some(StepOutcome::Failed(failure.clone()));
        }
      }
      EventKind::SleepScheduled { position, wake_at } => {
        self.calls.insert(
          *position,
          Call::Sleep(SleepCall {
            wake_at: *wake_at,
            elapsed: false,
          }),
        );
      }
      EventKind::SleepElapsed { position } => {
        if let Some(Call::Sleep(sleep)) = self.calls.get_mut(position) {
          sleep.elapsed = true;
        }
      }
      EventKind::HookCreated {
        position,
        token,
        multi_shot,
        schema,
        ..
      } => {
        self.calls.insert(
          *position,
          Call::Hook(HookCall {
            token: token.clone(),
            multi_shot: *multi_shot,
            schema: schema.clone(),
            resumes: Vec::new(),
          }),
        );
      }
      EventKind::HookConflict { position, token } => {
        self.calls.insert(
          *position,
          Call::Conflict {
            token: token.clone(),
          },
        );
      }
      EventKind::HookResumed {
        position, payload, ..
      } => {
        if let Some(Call::Hook(hook)) = self.calls.get_mut(position) {
          hook.resumes.push(payload.clone());
        }
      }
      EventKind::WebhookCreated {
        position,
        token,
        multi_shot,
        response,
      } => {
        self.calls.insert(
          *position,
          Call::Webhook(WebhookCall {
            token: token.clone(),
            multi_shot: *multi_shot,
            response: response.clone(),
            requests: Vec::new(),
          }),
        );
      }
      EventKind::WebhookReceived {
        position,
        token,
        request,
      } => {
        self
          .requests
          .insert(request.request_id.clone(), token.clone());
        if let Some(Call::Webhook(webhook)) = self.calls.get_mut(position) {
          webhook.requests.push(request.clone());
        }
      }
      EventKind::WebhookResponded {
        request_id,
        response,
        ..
      } => {
        self
          .responses
          .insert(request_id.clone(), response.clone());
      }
      EventKind::StreamWrite {
        namespace, index, ..
      } => {
        let stream = self.streams.entry(namespace.clone()).or_default();
        stream.next_index = stream.next_index.max(index + 1);
      }
      EventKind::StreamClosed { namespace } => {
        self.streams.entry(namespace.clone()).or_default().closed = true;
      }
      EventKind::RunCancelled { reason } => {
        self.cancelled = Some(reason.clone());
      }
      EventKind::RunCompleted { output } => {
        self.completed = Some(output.clone());
      }
      EventKind::RunFailed { failure } => {
        self.failed = Some(failure.clone());
      }
    }
  }

  fn step_call_mut(&mut self, step_id: &str) -> Option<&mut StepCall> {
    let position = self.steps.get(step_id)?;
    match self.calls.get_mut(position) {
      Some(Call::Step(step)) => Some(step),
      _ => None,
    }
  }

  /// Name of the workflow, from `RunCreated`.
  pub fn workflow(&self) -> Option<&str> {
    self.workflow.as_deref()
  }

  pub fn input(&self) -> &serde_json::Value {
    &self.input
  }

  /// The call recorded at `position`.
  pub fn call(&self, position: u32) -> Option<&Call> {
    self.calls.get(&position)
  }

  pub fn calls(&self) -> impl Iterator<Item = (u32, &Call)> {
    self.calls.iter().map(|(position, call)| (*position, call))
  }

  /// The step scheduled under `step_id`.
  pub fn step(&self, step_id: &str) -> Option<&StepCall> {
    match self.calls.get(self.steps.get(step_id)?) {
      Some(Call::Step(step)) => Some(step),
      _ => None,
    }
  }

  /// Highest attempt number started for a step, 0 if none.
  pub fn started_attempts(&self, step_id: &str) -> u32 {
    self.started.get(step_id).copied().unwrap_or(0)
  }

  /// Failed attempts of a step, in order.
  pub fn attempts(&self, step_id: &str) -> &[AttemptRecord] {
    self.attempts.get(step_id).map(Vec::as_slice).unwrap_or(&[])
  }

  /// When `attempt` of a step was first started.
  pub fn started_at(&self, step_id: &str, attempt: u32) -> Option<DateTime<Utc>> {
    self.started_at.get(&(step_id.to_string(), attempt)).copied()
  }

  /// When the attempt after `attempt` is due, if `attempt` failed and was
  /// scheduled for a retry.
  pub fn retry_at(&self, step_id: &str, attempt: u32) -> Option<DateTime<Utc>> {
    self.retries.get(&(step_id.to_string(), attempt)).copied()
  }

  /// Token of the webhook that received `request_id`.
  pub fn request_token(&self, request_id: &str) -> Option<&str> {
    self.requests.get(request_id).map(String::as_str)
  }

  /// Response recorded for a webhook request.
  pub fn response(&self, request_id: &str) -> Option<&WebhookResponse> {
    self.responses.get(request_id)
  }

  pub fn stream(&self, namespace: &str) -> Option<&StreamState> {
    self.streams.get(namespace)
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.is_some()
  }

  /// Reason given to `cancel`, if the run was cancelled with one.
  pub fn cancel_reason(&self) -> Option<&str> {
    self.cancelled.as_ref()?.as_deref()
  }

  pub fn output(&self) -> Option<&serde_json::Value> {
    self.completed.as_ref()
  }

  pub fn failure(&self) -> Option<&RunFailure> {
    self.failed.as_ref()
  }

  /// Whether a terminal event has been recorded.
  pub fn is_terminal(&self) -> bool {
    self.cancelled.is_some() || self.completed.is_some() || self.failed.is_some()
  }

  /// Sequence number of the last folded event.
  pub fn last_seq(&self) -> Seq {
    self.last_seq
  }
}
