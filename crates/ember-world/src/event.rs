//! Run events.
//!
//! Events are the single source of truth for a run. They are append-only,
//! ordered by `seq` within a run and never rewritten. Run records, token
//! records and queue messages are derived bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ResponseMode, RunFailure, StepFailure, WebhookRequest, WebhookResponse};

/// Sequence number of an event within its run. Starts at 1.
pub type Seq = u64;

/// Kind and payload of a run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
  /// The run was created by `start`.
  RunCreated {
    workflow: String,
    input: serde_json::Value,
  },

  /// The orchestrator issued a step call at `position`.
  StepScheduled {
    position: u32,
    step_id: String,
    step: String,
    args: serde_json::Value,
    max_retries: u32,
    /// Webhook request this step must answer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    responds_to: Option<String>,
  },

  /// An attempt of a step began executing.
  StepStarted { step_id: String, attempt: u32 },

  /// An attempt failed and will be retried at `retry_at`.
  StepRetrying {
    step_id: String,
    attempt: u32,
    error: String,
    retry_at: DateTime<Utc>,
  },

  /// A step produced its result.
  StepCompleted {
    step_id: String,
    attempt: u32,
    result: serde_json::Value,
  },

  /// A step failed terminally.
  StepFailed {
    step_id: String,
    attempt: u32,
    failure: StepFailure,
  },

  SleepScheduled {
    position: u32,
    wake_at: DateTime<Utc>,
  },

  SleepElapsed { position: u32 },

  HookCreated {
    position: u32,
    token: String,
    multi_shot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema: Option<serde_json::Value>,
    #[serde(default)]
    metadata: serde_json::Value,
  },

  /// Hook or webhook creation at `position` was rejected because the token
  /// was already active.
  HookConflict { position: u32, token: String },

  HookResumed {
    position: u32,
    token: String,
    payload: serde_json::Value,
  },

  WebhookCreated {
    position: u32,
    token: String,
    multi_shot: bool,
    response: ResponseMode,
  },

  WebhookReceived {
    position: u32,
    token: String,
    request: WebhookRequest,
  },

  WebhookResponded {
    token: String,
    request_id: String,
    response: WebhookResponse,
  },

  StreamWrite {
    namespace: String,
    index: u64,
    chunk: serde_json::Value,
  },

  StreamClosed { namespace: String },

  RunCancelled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
  },

  RunCompleted { output: serde_json::Value },

  RunFailed { failure: RunFailure },
}

impl EventKind {
  /// Key under which duplicate appends are suppressed.
  ///
  /// Two events of the same run with equal keys never both land in the log.
  pub fn dedup_key(&self) -> Option<String> {
    match self {
      EventKind::RunCreated { .. } => Some("run_created".to_string()),
      EventKind::StepScheduled { position, .. }
      | EventKind::SleepScheduled { position, .. }
      | EventKind::HookCreated { position, .. }
      | EventKind::HookConflict { position, .. }
      | EventKind::WebhookCreated { position, .. } => Some(format!("call:{position}")),
      EventKind::StepStarted { step_id, attempt } => {
        Some(format!("step_started:{step_id}:{attempt}"))
      }
      EventKind::StepRetrying {
        step_id, attempt, ..
      } => Some(format!("step_retrying:{step_id}:{attempt}")),
      EventKind::StepCompleted { step_id, .. } | EventKind::StepFailed { step_id, .. } => {
        Some(format!("step_outcome:{step_id}"))
      }
      EventKind::SleepElapsed { position } => Some(format!("sleep_elapsed:{position}")),
      EventKind::WebhookResponded { request_id, .. } => {
        Some(format!("webhook_responded:{request_id}"))
      }
      EventKind::StreamWrite {
        namespace, index, ..
      } => Some(format!("stream:{namespace}:{index}")),
      EventKind::StreamClosed { namespace } => Some(format!("stream_closed:{namespace}")),
      EventKind::RunCancelled { .. }
      | EventKind::RunCompleted { .. }
      | EventKind::RunFailed { .. } => Some("run_terminal".to_string()),
      EventKind::HookResumed { .. } | EventKind::WebhookReceived { .. } => None,
    }
  }

  /// Short name used in logs and the CLI.
  pub fn name(&self) -> &'static str {
    match self {
      EventKind::RunCreated { .. } => "run_created",
      EventKind::StepScheduled { .. } => "step_scheduled",
      EventKind::StepStarted { .. } => "step_started",
      EventKind::StepRetrying { .. } => "step_retrying",
      EventKind::StepCompleted { .. } => "step_completed",
      EventKind::StepFailed { .. } => "step_failed",
      EventKind::SleepScheduled { .. } => "sleep_scheduled",
      EventKind::SleepElapsed { .. } => "sleep_elapsed",
      EventKind::HookCreated { .. } => "hook_created",
      EventKind::HookConflict { .. } => "hook_conflict",
      EventKind::HookResumed { .. } => "hook_resumed",
      EventKind::WebhookCreated { .. } => "webhook_created",
      EventKind::WebhookReceived { .. } => "webhook_received",
      EventKind::WebhookResponded { .. } => "webhook_responded",
      EventKind::StreamWrite { .. } => "stream_write",
      EventKind::StreamClosed { .. } => "stream_closed",
      EventKind::RunCancelled { .. } => "run_cancelled",
      EventKind::RunCompleted { .. } => "run_completed",
      EventKind::RunFailed { .. } => "run_failed",
    }
  }

  /// Whether this event ends the run.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      EventKind::RunCancelled { .. } | EventKind::RunCompleted { .. } | EventKind::RunFailed { .. }
    )
  }
}

/// An event as stored in a run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub seq: Seq,
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub kind: EventKind,
}

/// Outcome of `World::append_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum Appended {
  /// The event was written with this sequence number.
  New(Event),
  /// An event with the same dedup key already exists; nothing was written.
  Duplicate,
}

impl Appended {
  pub fn is_new(&self) -> bool {
    matches!(self, Appended::New(_))
  }

  pub fn event(&self) -> Option<&Event> {
    match self {
      Appended::New(event) => Some(event),
      Appended::Duplicate => None,
    }
  }
}
