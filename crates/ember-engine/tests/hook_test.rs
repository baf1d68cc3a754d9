//! Integration tests for hooks and webhooks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ember_engine::{Engine, EngineConfig, EngineError, RetryPolicy, Runner};
use ember_workflow::{
  HookOptions, Registry, Step, StepContext, StepError, WebhookOptions, Workflow, WorkflowContext,
  WorkflowError,
};
use ember_world::{
  FailureKind, ManualClock, MemoryWorld, RunStatus, WebhookRequest, WebhookResponse, World,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn test_engine(registry: Registry) -> Engine {
  let config = EngineConfig {
    retry: RetryPolicy::immediate(),
    poll_interval_ms: 10,
    webhook_response_timeout_ms: 5_000,
    ..EngineConfig::default()
  };
  Engine::builder(Arc::new(MemoryWorld::new()), registry)
    .clock(Arc::new(ManualClock::new(Utc::now())))
    .config(config)
    .build()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
struct Approval {
  approved: bool,
}

/// Waits for a single approval of an order.
struct ApproveOrder;

impl Workflow for ApproveOrder {
  const NAME: &'static str = "approve_order";
  type Input = u32;
  type Output = bool;

  fn run(&self, ctx: &mut WorkflowContext, order: u32) -> Result<bool, WorkflowError> {
    let hook = ctx.create_hook::<Approval>(HookOptions::token(format!("approval:{order}")))?;
    let decision = ctx.next_payload(&hook)?;
    Ok(decision.approved)
  }
}

#[tokio::test]
async fn test_hook_rejects_invalid_payload_without_mutation() {
  let engine = test_engine(Registry::new().workflow(ApproveOrder));

  let run = engine.start::<ApproveOrder>(&7).await.unwrap();
  engine.run_until_idle().await.unwrap();
  assert_eq!(run.status().await.unwrap(), RunStatus::Suspended);
  let before = run.events().await.unwrap();

  match engine.resume_hook("approval:7", json!({"approved": "yes"})).await {
    Err(EngineError::InvalidPayload { token, errors }) => {
      assert_eq!(token, "approval:7");
      assert!(!errors.is_empty());
    }
    other => panic!("unexpected result: {other:?}"),
  }
  assert_eq!(run.events().await.unwrap(), before);

  let resumed = engine
    .resume_hook("approval:7", json!({"approved": true}))
    .await
    .unwrap();
  assert_eq!(resumed, run.id());
  engine.run_until_idle().await.unwrap();
  assert!(run.wait_for::<bool>().await.unwrap());

  // Finished runs release their tokens.
  match engine.resume_hook("approval:7", json!({"approved": false})).await {
    Err(EngineError::HookNotFound { .. }) => {}
    other => panic!("unexpected result: {other:?}"),
  }
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
  let engine = test_engine(Registry::new().workflow(ApproveOrder));
  match engine.resume_hook("nobody", json!({"approved": true})).await {
    Err(EngineError::HookNotFound { token }) => assert_eq!(token, "nobody"),
    other => panic!("unexpected result: {other:?}"),
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_single_winner() {
  let engine = test_engine(Registry::new().workflow(ApproveOrder));
  let run = engine.start::<ApproveOrder>(&9).await.unwrap();
  engine.run_until_idle().await.unwrap();

  let mut attempts = Vec::new();
  for i in 0..8 {
    let engine = engine.clone();
    attempts.push(tokio::spawn(async move {
      engine
        .resume_hook("approval:9", json!({"approved": i % 2 == 0}))
        .await
    }));
  }

  let mut accepted = 0;
  for attempt in attempts {
    match attempt.await.unwrap() {
      Ok(_) => accepted += 1,
      Err(EngineError::HookAlreadyResumed { .. }) => {}
      Err(e) => panic!("unexpected error: {e}"),
    }
  }
  assert_eq!(accepted, 1);

  engine.run_until_idle().await.unwrap();
  assert_eq!(run.status().await.unwrap(), RunStatus::Completed);
  let resumes = run
    .events()
    .await
    .unwrap()
    .iter()
    .filter(|e| e.kind.name() == "hook_resumed")
    .count();
  assert_eq!(resumes, 1);
}

#[tokio::test]
async fn test_duplicate_token_fails_second_run() {
  let engine = test_engine(Registry::new().workflow(ApproveOrder));

  let first = engine.start::<ApproveOrder>(&42).await.unwrap();
  let second = engine.start::<ApproveOrder>(&42).await.unwrap();
  engine.run_until_idle().await.unwrap();

  assert_eq!(first.status().await.unwrap(), RunStatus::Suspended);
  assert_eq!(second.status().await.unwrap(), RunStatus::Failed);
  let failure = second.failure().await.unwrap().unwrap();
  assert_eq!(failure.kind, FailureKind::TokenConflict);

  // The token still belongs to the first run.
  let token = engine.world().get_token("approval:42").await.unwrap();
  assert_eq!(token.run_id, first.id());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
struct Vote {
  choice: String,
}

/// Collects three votes from a multi-shot hook.
struct Poll;

impl Workflow for Poll {
  const NAME: &'static str = "poll";
  type Input = ();
  type Output = Vec<String>;

  fn run(&self, ctx: &mut WorkflowContext, _input: ()) -> Result<Vec<String>, WorkflowError> {
    let hook = ctx.create_hook::<Vote>(HookOptions::token("votes").multi_shot())?;
    let mut choices = Vec::new();
    for _ in 0..3 {
      choices.push(ctx.next_payload(&hook)?.choice);
    }
    Ok(choices)
  }
}

#[tokio::test]
async fn test_multi_shot_hook_delivers_in_order() {
  let engine = test_engine(Registry::new().workflow(Poll));

  let run = engine.start::<Poll>(&()).await.unwrap();
  engine.run_until_idle().await.unwrap();

  engine
    .resume_hook("votes", json!({"choice": "red"}))
    .await
    .unwrap();
  engine.run_until_idle().await.unwrap();
  assert_eq!(run.status().await.unwrap(), RunStatus::Suspended);

  for choice in ["green", "blue"] {
    engine
      .resume_hook("votes", json!({ "choice": choice }))
      .await
      .unwrap();
  }
  engine.run_until_idle().await.unwrap();

  assert_eq!(
    run.wait_for::<Vec<String>>().await.unwrap(),
    vec!["red", "green", "blue"]
  );
}

/// Returns the body of the first request delivered to a webhook.
struct Inbox;

impl Workflow for Inbox {
  const NAME: &'static str = "inbox";
  type Input = ();
  type Output = String;

  fn run(&self, ctx: &mut WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    let webhook = ctx.create_webhook(WebhookOptions::token("inbox"))?;
    let request = ctx.next_request(&webhook)?;
    Ok(request.body)
  }
}

#[tokio::test]
async fn test_static_webhook_answers_immediately() {
  let engine = test_engine(Registry::new().workflow(Inbox));

  let run = engine.start::<Inbox>(&()).await.unwrap();
  engine.run_until_idle().await.unwrap();

  let response = engine
    .resume_webhook("inbox", WebhookRequest::new("POST", "/inbox").with_body("hello"))
    .await
    .unwrap();
  assert_eq!(response, WebhookResponse::accepted());

  engine.run_until_idle().await.unwrap();
  assert_eq!(run.wait_for::<String>().await.unwrap(), "hello");
}

struct Echo;

#[async_trait]
impl Step for Echo {
  const NAME: &'static str = "echo";
  type Input = String;
  type Output = ();

  async fn run(&self, ctx: &StepContext, body: String) -> Result<(), StepError> {
    ctx
      .respond(WebhookResponse::new(200).with_body(format!("echo: {body}")))
      .await
  }
}

struct Mute;

#[async_trait]
impl Step for Mute {
  const NAME: &'static str = "mute";
  const MAX_RETRIES: u32 = 0;
  type Input = String;
  type Output = ();

  async fn run(&self, _ctx: &StepContext, _body: String) -> Result<(), StepError> {
    Ok(())
  }
}

/// Answers a webhook request through a handler step.
struct Responder {
  silent: bool,
}

impl Workflow for Responder {
  const NAME: &'static str = "responder";
  type Input = ();
  type Output = ();

  fn run(&self, ctx: &mut WorkflowContext, _input: ()) -> Result<(), WorkflowError> {
    let webhook = ctx.create_webhook(WebhookOptions::token("responder").manual())?;
    let request = ctx.next_request(&webhook)?;
    if self.silent {
      ctx.respond_with::<Mute>(&request, &request.body)
    } else {
      ctx.respond_with::<Echo>(&request, &request.body)
    }
  }
}

async fn wait_for_token(engine: &Engine, token: &str) {
  tokio::time::timeout(Duration::from_secs(5), async {
    while engine.world().get_token(token).await.is_err() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("token was never registered");
}

fn responder_engine(silent: bool) -> Engine {
  test_engine(
    Registry::new()
      .workflow(Responder { silent })
      .step(Echo)
      .step(Mute),
  )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_webhook_returns_handler_response() {
  let engine = responder_engine(false);
  let cancel = CancellationToken::new();
  let runner = tokio::spawn(Runner::new(engine.clone()).start(cancel.clone()));

  let run = engine.start::<Responder>(&()).await.unwrap();
  wait_for_token(&engine, "responder").await;

  let response = engine
    .resume_webhook("responder", WebhookRequest::new("POST", "/r").with_body("hi"))
    .await
    .unwrap();
  assert_eq!(response.status, 200);
  assert_eq!(response.body, "echo: hi");

  tokio::time::timeout(Duration::from_secs(5), run.wait())
    .await
    .unwrap()
    .unwrap();

  cancel.cancel();
  runner.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_handler_reports_response_not_sent() {
  let engine = responder_engine(true);
  let cancel = CancellationToken::new();
  let runner = tokio::spawn(Runner::new(engine.clone()).start(cancel.clone()));

  let run = engine.start::<Responder>(&()).await.unwrap();
  wait_for_token(&engine, "responder").await;

  match engine
    .resume_webhook("responder", WebhookRequest::new("POST", "/r"))
    .await
  {
    Err(EngineError::ResponseNotSent { token, .. }) => assert_eq!(token, "responder"),
    other => panic!("unexpected result: {other:?}"),
  }

  match tokio::time::timeout(Duration::from_secs(5), run.wait()).await.unwrap() {
    Err(EngineError::RunFailed { failure, .. }) => {
      assert_eq!(failure.kind, FailureKind::ResponseNotSent)
    }
    other => panic!("unexpected result: {other:?}"),
  }

  cancel.cancel();
  runner.await.unwrap().unwrap();
}
