//! Runs recover from lost writes and stay finished once cancelled.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ember_engine::{Engine, EngineConfig, RetryPolicy};
use ember_workflow::{
  HookOptions, Registry, Step, StepContext, StepError, Workflow, WorkflowContext, WorkflowError,
};
use ember_world::{
  Appended, Claimed, Clock, Event, EventKind, ManualClock, MemoryWorld, QueueMessage, RunRecord,
  RunStatus, Seq, TokenRecord, World, WorldError,
};
use tokio::sync::Notify;

type Matcher = Box<dyn Fn(&QueueMessage) -> bool + Send>;

/// Memory world that can drop one enqueue and hold token registration.
#[derive(Default)]
struct FaultyWorld {
  inner: MemoryWorld,
  fail_enqueue: Mutex<Option<Matcher>>,
  registration: Option<Gate>,
}

#[derive(Default)]
struct Gate {
  entered: Notify,
  release: Notify,
}

impl FaultyWorld {
  /// Fail the next enqueue of a message matching `matcher`.
  fn fail_next_enqueue(&self, matcher: impl Fn(&QueueMessage) -> bool + Send + 'static) {
    *self.fail_enqueue.lock().unwrap() = Some(Box::new(matcher));
  }

  fn gated() -> Self {
    Self {
      registration: Some(Gate::default()),
      ..Self::default()
    }
  }

  fn gate(&self) -> &Gate {
    self.registration.as_ref().unwrap()
  }
}

#[async_trait]
impl World for FaultyWorld {
  async fn create_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    self.inner.create_run(run).await
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, WorldError> {
    self.inner.get_run(run_id).await
  }

  async fn update_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    self.inner.update_run(run).await
  }

  async fn list_runs(&self) -> Result<Vec<RunRecord>, WorldError> {
    self.inner.list_runs().await
  }

  async fn delete_run(&self, run_id: &str) -> Result<(), WorldError> {
    self.inner.delete_run(run_id).await
  }

  async fn append_event(
    &self,
    run_id: &str,
    kind: EventKind,
    at: DateTime<Utc>,
  ) -> Result<Appended, WorldError> {
    self.inner.append_event(run_id, kind, at).await
  }

  async fn read_events(&self, run_id: &str, from: Seq) -> Result<Vec<Event>, WorldError> {
    self.inner.read_events(run_id, from).await
  }

  async fn enqueue(
    &self,
    message: QueueMessage,
    deliver_at: DateTime<Utc>,
  ) -> Result<(), WorldError> {
    let fail = {
      let mut slot = self.fail_enqueue.lock().unwrap();
      let hit = slot.as_ref().is_some_and(|matcher| matcher(&message));
      if hit {
        slot.take();
      }
      hit
    };
    if fail {
      return Err(WorldError::Io(std::io::Error::other("queue unavailable")));
    }
    self.inner.enqueue(message, deliver_at).await
  }

  async fn claim_next_ready(
    &self,
    now: DateTime<Utc>,
    lease: Duration,
  ) -> Result<Option<Claimed>, WorldError> {
    self.inner.claim_next_ready(now, lease).await
  }

  async fn ack(&self, claim_id: u64) -> Result<(), WorldError> {
    self.inner.ack(claim_id).await
  }

  async fn next_delivery(&self) -> Result<Option<DateTime<Utc>>, WorldError> {
    self.inner.next_delivery().await
  }

  async fn register_token(&self, record: &TokenRecord) -> Result<(), WorldError> {
    if let Some(gate) = &self.registration {
      gate.entered.notify_one();
      gate.release.notified().await;
    }
    self.inner.register_token(record).await
  }

  async fn get_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    self.inner.get_token(token).await
  }

  async fn consume_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    self.inner.consume_token(token).await
  }

  async fn release_tokens(&self, run_id: &str) -> Result<(), WorldError> {
    self.inner.release_tokens(run_id).await
  }
}

fn test_engine(world: Arc<FaultyWorld>, registry: Registry) -> (Engine, ManualClock) {
  let clock = ManualClock::new(Utc::now());
  let config = EngineConfig {
    retry: RetryPolicy::immediate(),
    ..EngineConfig::default()
  };
  let engine = Engine::builder(world, registry)
    .clock(Arc::new(clock.clone()))
    .config(config)
    .build();
  (engine, clock)
}

/// Let leased messages come back, then drain the queue.
async fn redeliver(engine: &Engine, clock: &ManualClock) {
  clock.advance(engine.config().lease() + Duration::seconds(1));
  engine.run_until_idle().await.unwrap();
}

fn names(events: &[Event]) -> Vec<&'static str> {
  events.iter().map(|e| e.kind.name()).collect()
}

/// Fails its first `failures` attempts with an unclassified error.
struct Charge {
  calls: Arc<AtomicU32>,
  failures: u32,
}

#[async_trait]
impl Step for Charge {
  const NAME: &'static str = "charge";
  type Input = u32;
  type Output = u32;

  async fn run(&self, _ctx: &StepContext, cents: u32) -> Result<u32, StepError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if call <= self.failures {
      return Err(StepError::other("gateway timeout"));
    }
    Ok(cents)
  }
}

/// Charges, waits an hour, and reports the amount.
struct Invoice;

impl Workflow for Invoice {
  const NAME: &'static str = "invoice";
  type Input = u32;
  type Output = u32;

  fn run(&self, ctx: &mut WorkflowContext, cents: u32) -> Result<u32, WorkflowError> {
    let charged = ctx.step::<Charge>(&cents)?;
    ctx.sleep(Duration::hours(1))?;
    Ok(charged)
  }
}

fn invoice_registry(calls: &Arc<AtomicU32>, failures: u32) -> Registry {
  Registry::new().workflow(Invoice).step(Charge {
    calls: calls.clone(),
    failures,
  })
}

#[tokio::test]
async fn test_lost_step_enqueue_is_reissued() {
  let world = Arc::new(FaultyWorld::default());
  world.fail_next_enqueue(|m| matches!(m, QueueMessage::Step { .. }));
  let calls = Arc::new(AtomicU32::new(0));
  let (engine, clock) = test_engine(world.clone(), invoice_registry(&calls, 0));

  let run = engine.start::<Invoice>(&250).await.unwrap();
  engine.run_until_idle().await.unwrap();
  assert_eq!(
    names(&run.events().await.unwrap()),
    vec!["run_created", "step_scheduled"]
  );
  assert_eq!(calls.load(Ordering::SeqCst), 0);

  redeliver(&engine, &clock).await;
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(run.status().await.unwrap(), RunStatus::Suspended);

  clock.advance(Duration::hours(1));
  engine.run_until_idle().await.unwrap();
  assert_eq!(run.wait_for::<u32>().await.unwrap(), 250);
}

#[tokio::test]
async fn test_lost_wake_is_rescheduled() {
  let world = Arc::new(FaultyWorld::default());
  world.fail_next_enqueue(|m| matches!(m, QueueMessage::Wake { .. }));
  let calls = Arc::new(AtomicU32::new(0));
  let (engine, clock) = test_engine(world.clone(), invoice_registry(&calls, 0));

  let run = engine.start::<Invoice>(&100).await.unwrap();
  engine.run_until_idle().await.unwrap();
  assert!(world.next_delivery().await.unwrap().is_some());

  redeliver(&engine, &clock).await;
  clock.advance(Duration::hours(1));
  engine.run_until_idle().await.unwrap();

  assert_eq!(run.wait_for::<u32>().await.unwrap(), 100);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lost_retry_enqueue_is_reissued() {
  let world = Arc::new(FaultyWorld::default());
  world.fail_next_enqueue(|m| matches!(m, QueueMessage::Step { attempt: 2, .. }));
  let calls = Arc::new(AtomicU32::new(0));
  let (engine, clock) = test_engine(world.clone(), invoice_registry(&calls, 1));

  let run = engine.start::<Invoice>(&75).await.unwrap();
  engine.run_until_idle().await.unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(
    names(&run.events().await.unwrap()).contains(&"step_retrying"),
    "first attempt should have been recorded as retrying"
  );

  redeliver(&engine, &clock).await;
  assert_eq!(calls.load(Ordering::SeqCst), 2);

  clock.advance(Duration::hours(1));
  engine.run_until_idle().await.unwrap();
  assert_eq!(run.wait_for::<u32>().await.unwrap(), 75);
}

#[tokio::test]
async fn test_lost_advance_after_step_is_requeued() {
  let world = Arc::new(FaultyWorld::default());
  let calls = Arc::new(AtomicU32::new(0));
  let (engine, clock) = test_engine(world.clone(), invoice_registry(&calls, 0));

  let run = engine.start::<Invoice>(&40).await.unwrap();
  world.fail_next_enqueue(|m| matches!(m, QueueMessage::Workflow { .. }));
  engine.run_until_idle().await.unwrap();
  let events = run.events().await.unwrap();
  assert_eq!(events.last().map(|e| e.kind.name()), Some("step_completed"));

  redeliver(&engine, &clock).await;
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(names(&run.events().await.unwrap()).contains(&"sleep_scheduled"));

  clock.advance(Duration::hours(1));
  engine.run_until_idle().await.unwrap();
  assert_eq!(run.wait_for::<u32>().await.unwrap(), 40);
}

/// Waits on a single approval hook.
struct Approve;

impl Workflow for Approve {
  const NAME: &'static str = "approve";
  type Input = ();
  type Output = bool;

  fn run(&self, ctx: &mut WorkflowContext, _input: ()) -> Result<bool, WorkflowError> {
    let hook = ctx.create_hook::<bool>(HookOptions::token("approve:1"))?;
    ctx.next_payload(&hook)
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_waits_for_advance_and_releases_token() {
  let world = Arc::new(FaultyWorld::gated());
  let (engine, _clock) = test_engine(world.clone(), Registry::new().workflow(Approve));

  let run = engine.start::<Approve>(&()).await.unwrap();
  let driver = tokio::spawn({
    let engine = engine.clone();
    async move { engine.run_until_idle().await }
  });
  world.gate().entered.notified().await;

  let cancel = tokio::spawn({
    let engine = engine.clone();
    let run_id = run.id().to_string();
    async move { engine.cancel(&run_id, None).await }
  });
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert!(!cancel.is_finished());

  world.gate().release.notify_one();
  driver.await.unwrap().unwrap();
  cancel.await.unwrap().unwrap();

  assert_eq!(run.status().await.unwrap(), RunStatus::Cancelled);
  let events = run.events().await.unwrap();
  assert_eq!(
    names(&events),
    vec!["run_created", "hook_created", "run_cancelled"]
  );
  assert!(matches!(
    world.get_token("approve:1").await,
    Err(WorldError::TokenNotFound(_))
  ));
}

/// Blocks until released, then succeeds.
struct Hold {
  runs: Arc<AtomicU32>,
  started: Arc<Notify>,
  release: Arc<Notify>,
}

#[async_trait]
impl Step for Hold {
  const NAME: &'static str = "hold";
  type Input = ();
  type Output = String;

  async fn run(&self, _ctx: &StepContext, _input: ()) -> Result<String, StepError> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    self.started.notify_one();
    self.release.notified().await;
    Ok("done".to_string())
  }
}

struct Holding;

impl Workflow for Holding {
  const NAME: &'static str = "holding";
  type Input = ();
  type Output = String;

  fn run(&self, ctx: &mut WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    ctx.step::<Hold>(&())
  }
}

struct HoldFixture {
  runs: Arc<AtomicU32>,
  started: Arc<Notify>,
  release: Arc<Notify>,
}

impl HoldFixture {
  fn new() -> Self {
    Self {
      runs: Arc::new(AtomicU32::new(0)),
      started: Arc::new(Notify::new()),
      release: Arc::new(Notify::new()),
    }
  }

  fn registry(&self) -> Registry {
    Registry::new().workflow(Holding).step(Hold {
      runs: self.runs.clone(),
      started: self.started.clone(),
      release: self.release.clone(),
    })
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_step_result_after_cancel_is_discarded() {
  let fixture = HoldFixture::new();
  let (engine, _clock) = test_engine(Arc::new(FaultyWorld::default()), fixture.registry());
  let HoldFixture { started, release, .. } = fixture;

  let run = engine.start::<Holding>(&()).await.unwrap();
  let driver = tokio::spawn({
    let engine = engine.clone();
    async move { engine.run_until_idle().await }
  });
  started.notified().await;

  engine
    .cancel(run.id(), Some("operator".to_string()))
    .await
    .unwrap();
  release.notify_one();
  driver.await.unwrap().unwrap();

  let events = run.events().await.unwrap();
  assert!(!names(&events).contains(&"step_completed"));
  assert_eq!(events.last().map(|e| e.kind.name()), Some("run_cancelled"));
  assert_eq!(run.status().await.unwrap(), RunStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_delivery_waits_for_running_attempt() {
  let fixture = HoldFixture::new();
  let world = Arc::new(FaultyWorld::default());
  let (engine, clock) = test_engine(world.clone(), fixture.registry());

  let run = engine.start::<Holding>(&()).await.unwrap();
  let driver = tokio::spawn({
    let engine = engine.clone();
    async move { engine.run_until_idle().await }
  });
  fixture.started.notified().await;

  // A second copy of the running attempt reaches another worker.
  let duplicate = QueueMessage::Step {
    run_id: run.id().to_string(),
    step_id: "0:hold".to_string(),
    attempt: 1,
  };
  world.enqueue(duplicate, clock.now()).await.unwrap();
  engine.run_until_idle().await.unwrap();
  assert_eq!(fixture.runs.load(Ordering::SeqCst), 1);

  fixture.release.notify_one();
  driver.await.unwrap().unwrap();
  assert_eq!(run.wait_for::<String>().await.unwrap(), "done");

  // The deferred copy finds the outcome and does nothing.
  redeliver(&engine, &clock).await;
  assert_eq!(fixture.runs.load(Ordering::SeqCst), 1);
}
