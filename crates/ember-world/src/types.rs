use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
  Running,
  Suspended,
  Completed,
  Failed,
  Cancelled,
}

impl RunStatus {
  /// Whether the run can no longer make progress.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      RunStatus::Running => "running",
      RunStatus::Suspended => "suspended",
      RunStatus::Completed => "completed",
      RunStatus::Failed => "failed",
      RunStatus::Cancelled => "cancelled",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "running" => Some(RunStatus::Running),
      "suspended" => Some(RunStatus::Suspended),
      "completed" => Some(RunStatus::Completed),
      "failed" => Some(RunStatus::Failed),
      "cancelled" => Some(RunStatus::Cancelled),
      _ => None,
    }
  }
}

impl std::fmt::Display for RunStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Classification of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
  /// A step or orchestrator raised a non-retryable error.
  Fatal,
  /// A step ran out of retry attempts.
  Exhausted,
  /// Replay diverged from the recorded history.
  NonDeterminism,
  /// An argument or result could not be serialized.
  Serialization,
  /// A hook or webhook token was already active.
  TokenConflict,
  /// A webhook handler step finished without answering the request.
  ResponseNotSent,
  /// The run was cancelled.
  Cancelled,
}

impl std::fmt::Display for FailureKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      FailureKind::Fatal => "fatal",
      FailureKind::Exhausted => "exhausted",
      FailureKind::NonDeterminism => "non_determinism",
      FailureKind::Serialization => "serialization",
      FailureKind::TokenConflict => "token_conflict",
      FailureKind::ResponseNotSent => "response_not_sent",
      FailureKind::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Terminal failure of a single step, as recorded in `StepFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
  pub kind: FailureKind,
  pub message: String,
}

/// One failed attempt of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
  pub attempt: u32,
  pub error: String,
  pub at: DateTime<Utc>,
}

/// Attempt history of the step that caused a run to fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
  pub step_id: String,
  pub step: String,
  pub attempts: Vec<AttemptRecord>,
}

/// Terminal error of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
  pub kind: FailureKind,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step: Option<StepDiagnostics>,
}

impl std::fmt::Display for RunFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}: {}", self.kind, self.message)
  }
}

/// A run as stored by a world. This is a projection of the event log kept
/// for cheap status queries; the log stays authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
  pub run_id: String,
  pub workflow: String,
  pub status: RunStatus,
  pub input: serde_json::Value,
  pub output: Option<serde_json::Value>,
  pub failure: Option<RunFailure>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
  /// A freshly started run.
  pub fn new(
    run_id: impl Into<String>,
    workflow: impl Into<String>,
    input: serde_json::Value,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      run_id: run_id.into(),
      workflow: workflow.into(),
      status: RunStatus::Running,
      input,
      output: None,
      failure: None,
      created_at: now,
      updated_at: now,
      completed_at: None,
    }
  }
}

/// Whether a token belongs to a hook or a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
  Hook,
  Webhook,
}

/// How a webhook answers delivered requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ResponseMode {
  /// Answer every request immediately with a fixed response.
  Static { response: WebhookResponse },
  /// A handler step must call `respond` for each request.
  Manual,
}

impl Default for ResponseMode {
  fn default() -> Self {
    ResponseMode::Static {
      response: WebhookResponse::accepted(),
    }
  }
}

/// A registered hook or webhook token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
  pub token: String,
  pub run_id: String,
  /// Call position of the `HookCreated`/`WebhookCreated` event.
  pub position: u32,
  pub kind: TokenKind,
  pub multi_shot: bool,
  pub schema: Option<serde_json::Value>,
  pub response: Option<ResponseMode>,
  pub consumed: bool,
  pub created_at: DateTime<Utc>,
}

/// An inbound HTTP request delivered to a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
  /// Engine-assigned identity of this delivery.
  #[serde(default)]
  pub request_id: String,
  pub method: String,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: String,
}

impl WebhookRequest {
  pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
    Self {
      request_id: String::new(),
      method: method.into(),
      url: url.into(),
      headers: BTreeMap::new(),
      body: String::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = body.into();
    self
  }

  /// Parse the body as JSON.
  pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_str(&self.body)
  }
}

/// The HTTP response returned to a webhook caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookResponse {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: String,
}

impl WebhookResponse {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: String::new(),
    }
  }

  /// `202 Accepted` with an empty body.
  pub fn accepted() -> Self {
    Self::new(202)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = body.into();
    self
  }
}

/// Work item carried by the world's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum QueueMessage {
  /// Advance a run's orchestrator.
  Workflow { run_id: String },
  /// Run one attempt of a step.
  Step {
    run_id: String,
    step_id: String,
    attempt: u32,
  },
  /// A sleep's wake instant has been reached.
  Wake { run_id: String, position: u32 },
}

impl QueueMessage {
  pub fn run_id(&self) -> &str {
    match self {
      QueueMessage::Workflow { run_id }
      | QueueMessage::Step { run_id, .. }
      | QueueMessage::Wake { run_id, .. } => run_id,
    }
  }
}

/// A queue message handed out by `claim_next_ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed {
  pub claim_id: u64,
  pub message: QueueMessage,
}
