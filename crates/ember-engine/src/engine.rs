//! The engine and its run coordinator API.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ember_workflow::{Call, History, Registry, StepOutcome, Workflow};
use ember_world::{
  Appended, Clock, Event, EventKind, QueueMessage, ResponseMode, RunRecord, RunStatus,
  SystemClock, TokenKind, WebhookRequest, WebhookResponse, World, WorldError,
};
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventNotifier, NoopNotifier, RunEvent};
use crate::run::RunHandle;

const EVENT_BUFFER: usize = 1024;

/// Per-run async locks, created on first use.
type LockMap = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

pub(crate) struct Inner {
  pub(crate) world: Arc<dyn World>,
  pub(crate) registry: Registry,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) config: EngineConfig,
  pub(crate) wakeup: Notify,
  notifier: Arc<dyn EventNotifier>,
  events: broadcast::Sender<RunEvent>,
  run_locks: LockMap,
  stream_locks: LockMap,
}

/// Durable workflow engine.
///
/// Cheap to clone; clones share state. Work is driven either by a
/// [`Runner`](crate::Runner) or, in tests, by [`Engine::run_until_idle`].
#[derive(Clone)]
pub struct Engine {
  pub(crate) inner: Arc<Inner>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
  world: Arc<dyn World>,
  registry: Registry,
  clock: Arc<dyn Clock>,
  config: EngineConfig,
  notifier: Arc<dyn EventNotifier>,
}

impl EngineBuilder {
  /// Use a different time source (e.g. `ManualClock` in tests).
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// Observe every appended event.
  pub fn notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn build(self) -> Engine {
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    Engine {
      inner: Arc::new(Inner {
        world: self.world,
        registry: self.registry,
        clock: self.clock,
        config: self.config,
        wakeup: Notify::new(),
        notifier: self.notifier,
        events,
        run_locks: std::sync::Mutex::new(HashMap::new()),
        stream_locks: std::sync::Mutex::new(HashMap::new()),
      }),
    }
  }
}

impl Engine {
  pub fn builder(world: Arc<dyn World>, registry: Registry) -> EngineBuilder {
    EngineBuilder {
      world,
      registry,
      clock: Arc::new(SystemClock),
      config: EngineConfig::default(),
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// An engine with the system clock and default configuration.
  pub fn new(world: Arc<dyn World>, registry: Registry) -> Self {
    Self::builder(world, registry).build()
  }

  pub fn world(&self) -> &Arc<dyn World> {
    &self.inner.world
  }

  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub(crate) fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  /// Receive every event appended from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
    self.inner.events.subscribe()
  }

  /// Start a run of `W`. Returns as soon as the run is persisted and queued.
  pub async fn start<W: Workflow>(&self, input: &W::Input) -> Result<RunHandle, EngineError> {
    self.start_named(W::NAME, serde_json::to_value(input)?).await
  }

  /// Start a run of the workflow registered under `name`.
  #[instrument(name = "run_start", skip(self, input), fields(workflow = %name))]
  pub async fn start_named(
    &self,
    name: &str,
    input: serde_json::Value,
  ) -> Result<RunHandle, EngineError> {
    if self.inner.registry.get_workflow(name).is_none() {
      return Err(EngineError::WorkflowNotFound {
        name: name.to_string(),
      });
    }

    let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
    let now = self.now();
    let run = RunRecord::new(&run_id, name, input.clone(), now);
    self.inner.world.create_run(&run).await?;
    self
      .append(
        &run_id,
        EventKind::RunCreated {
          workflow: name.to_string(),
          input,
        },
      )
      .await?;
    self
      .enqueue(
        QueueMessage::Workflow {
          run_id: run_id.clone(),
        },
        now,
      )
      .await?;

    info!(run_id = %run_id, workflow = %name, "run_started");
    Ok(RunHandle::new(self.clone(), run_id))
  }

  /// Handle to an existing run. Does not enqueue any work.
  pub async fn get_run(&self, run_id: &str) -> Result<RunHandle, EngineError> {
    self.inner.world.get_run(run_id).await?;
    Ok(RunHandle::new(self.clone(), run_id.to_string()))
  }

  /// Deliver a payload to the hook registered under `token`.
  ///
  /// Rejected without touching the run when the token is unknown, already
  /// consumed, or the payload fails the hook's schema.
  #[instrument(name = "hook_resume", skip(self, payload), fields(token = %token))]
  pub async fn resume_hook(
    &self,
    token: &str,
    payload: serde_json::Value,
  ) -> Result<String, EngineError> {
    let record = self.inner.world.get_token(token).await?;
    if record.kind != TokenKind::Hook {
      return Err(EngineError::HookNotFound {
        token: token.to_string(),
      });
    }
    if record.consumed {
      return Err(EngineError::HookAlreadyResumed {
        token: token.to_string(),
      });
    }
    if let Some(schema) = &record.schema {
      crate::schema::validate(token, schema, &payload)?;
    }

    // Serialize with advances so the resume lands after `HookCreated`.
    let lock = self.run_lock(&record.run_id);
    let guard = lock.lock().await;
    let record = self.inner.world.consume_token(token).await?;
    self
      .append(
        &record.run_id,
        EventKind::HookResumed {
          position: record.position,
          token: token.to_string(),
          payload,
        },
      )
      .await?;
    drop(guard);
    self.trigger(&record.run_id).await?;

    info!(run_id = %record.run_id, token = %token, "hook_resumed");
    Ok(record.run_id)
  }

  /// Deliver an HTTP request to the webhook registered under `token` and
  /// return the response it produces.
  #[instrument(name = "webhook_resume", skip(self, request), fields(token = %token))]
  pub async fn resume_webhook(
    &self,
    token: &str,
    mut request: WebhookRequest,
  ) -> Result<WebhookResponse, EngineError> {
    let record = self.inner.world.get_token(token).await?;
    if record.kind != TokenKind::Webhook {
      return Err(EngineError::HookNotFound {
        token: token.to_string(),
      });
    }
    if record.consumed {
      return Err(EngineError::HookAlreadyResumed {
        token: token.to_string(),
      });
    }

    request.request_id = uuid::Uuid::new_v4().to_string();
    let request_id = request.request_id.clone();
    let events = self.subscribe();

    let lock = self.run_lock(&record.run_id);
    let guard = lock.lock().await;
    let record = self.inner.world.consume_token(token).await?;
    let run_id = record.run_id.clone();
    self
      .append(
        &run_id,
        EventKind::WebhookReceived {
          position: record.position,
          token: token.to_string(),
          request,
        },
      )
      .await?;
    drop(guard);

    info!(run_id = %run_id, token = %token, request_id = %request_id, "webhook_received");

    match record.response.unwrap_or_default() {
      ResponseMode::Static { response } => {
        self
          .append(
            &run_id,
            EventKind::WebhookResponded {
              token: token.to_string(),
              request_id,
              response: response.clone(),
            },
          )
          .await?;
        self.trigger(&run_id).await?;
        Ok(response)
      }
      ResponseMode::Manual => {
        self.trigger(&run_id).await?;
        let wait = self.await_response(&run_id, token, &request_id, events);
        match tokio::time::timeout(self.inner.config.webhook_response_timeout(), wait).await {
          Ok(result) => result,
          Err(_) => {
            warn!(run_id = %run_id, token = %token, request_id = %request_id, "webhook_response_timeout");
            Err(EngineError::ResponseTimeout {
              token: token.to_string(),
            })
          }
        }
      }
    }
  }

  async fn await_response(
    &self,
    run_id: &str,
    token: &str,
    request_id: &str,
    mut events: broadcast::Receiver<RunEvent>,
  ) -> Result<WebhookResponse, EngineError> {
    let not_sent = |reason: String| EngineError::ResponseNotSent {
      token: token.to_string(),
      request_id: request_id.to_string(),
      reason,
    };

    loop {
      let history = self.history(run_id).await?;
      if let Some(response) = history.response(request_id) {
        return Ok(response.clone());
      }
      let handler_failure = history.calls().find_map(|(_, call)| match call {
        Call::Step(step) if step.responds_to.as_deref() == Some(request_id) => {
          match &step.outcome {
            Some(StepOutcome::Failed(failure)) => {
              Some(format!("{}: {}", failure.kind, failure.message))
            }
            _ => None,
          }
        }
        _ => None,
      });
      if let Some(reason) = handler_failure {
        return Err(not_sent(reason));
      }
      if history.is_terminal() {
        return Err(not_sent("run finished".to_string()));
      }

      loop {
        match events.recv().await {
          Ok(event) if event.run_id == run_id => break,
          Ok(_) => continue,
          Err(broadcast::error::RecvError::Lagged(_)) => break,
          Err(broadcast::error::RecvError::Closed) => {
            return Err(not_sent("engine shut down".to_string()));
          }
        }
      }
    }
  }

  /// Cancel a run. In-flight steps finish but their results are discarded.
  #[instrument(name = "run_cancel", skip(self, reason), fields(run_id = %run_id))]
  pub async fn cancel(&self, run_id: &str, reason: Option<String>) -> Result<(), EngineError> {
    // Waits for an advance in progress so nothing lands after the cancel.
    let lock = self.run_lock(run_id);
    let _guard = lock.lock().await;

    let history = self.history(run_id).await?;
    if history.is_terminal() {
      debug!(run_id = %run_id, "cancel_ignored_terminal");
      return Ok(());
    }
    self.finalize(run_id, EventKind::RunCancelled { reason }).await?;
    Ok(())
  }

  /// Delete a finished run and everything recorded for it.
  pub async fn purge(&self, run_id: &str) -> Result<(), EngineError> {
    let lock = self.run_lock(run_id);
    let guard = lock.lock().await;

    let run = self.inner.world.get_run(run_id).await?;
    if !run.status.is_terminal() {
      return Err(EngineError::RunActive {
        run_id: run_id.to_string(),
      });
    }
    self.inner.world.delete_run(run_id).await?;
    drop(guard);
    self.forget_locks(run_id);
    info!(run_id = %run_id, "run_purged");
    Ok(())
  }

  /// All runs, newest first.
  pub async fn list_runs(&self) -> Result<Vec<RunRecord>, EngineError> {
    Ok(self.inner.world.list_runs().await?)
  }

  /// Process every queue message that is due, one at a time, until none is.
  ///
  /// Deterministic driver for tests and one-shot tools. Messages that fail
  /// are left for redelivery after their lease expires.
  pub async fn run_until_idle(&self) -> Result<usize, EngineError> {
    let mut processed = 0;
    while let Some(claimed) = self
      .inner
      .world
      .claim_next_ready(self.now(), self.inner.config.lease())
      .await?
    {
      match self.process(&claimed.message).await {
        Ok(()) => self.inner.world.ack(claimed.claim_id).await?,
        Err(e) => {
          error!(run_id = %claimed.message.run_id(), error = %e, "message_failed");
        }
      }
      processed += 1;
    }
    Ok(processed)
  }

  /// Handle one queue message.
  pub(crate) async fn process(&self, message: &QueueMessage) -> Result<(), EngineError> {
    let result = match message {
      QueueMessage::Workflow { run_id } => self.advance(run_id, None).await.map(|_| ()),
      QueueMessage::Step {
        run_id,
        step_id,
        attempt,
      } => self.run_step(run_id, step_id, *attempt).await,
      QueueMessage::Wake { run_id, position } => self.wake(run_id, *position).await,
    };
    match result {
      Err(EngineError::RunNotFound { run_id }) => {
        debug!(run_id = %run_id, "message_dropped_run_missing");
        Ok(())
      }
      other => other,
    }
  }

  /// Elapse a sleep once its wake instant has passed.
  async fn wake(&self, run_id: &str, position: u32) -> Result<(), EngineError> {
    let history = self.history(run_id).await?;
    let Some(Call::Sleep(sleep)) = history.call(position) else {
      warn!(run_id = %run_id, position, "wake_without_sleep");
      return Ok(());
    };
    if history.is_terminal() {
      return Ok(());
    }
    if sleep.elapsed {
      // Redelivered after the elapse was recorded; make sure the run moves.
      return self.trigger(run_id).await;
    }
    if self.now() < sleep.wake_at {
      // Delivered early (clock skew between processes); try again later.
      self
        .inner
        .world
        .schedule_wake(run_id, position, sleep.wake_at)
        .await?;
      return Ok(());
    }

    debug!(run_id = %run_id, position, "sleep_elapsed");
    self
      .advance(run_id, Some(EventKind::SleepElapsed { position }))
      .await?;
    Ok(())
  }

  pub(crate) async fn history(&self, run_id: &str) -> Result<History, EngineError> {
    let events = self.inner.world.read_events(run_id, 1).await?;
    if events.is_empty() {
      // Distinguish a missing run from one that has not logged anything.
      self.inner.world.get_run(run_id).await?;
    }
    Ok(History::from_events(&events))
  }

  pub(crate) async fn events(&self, run_id: &str) -> Result<Vec<Event>, EngineError> {
    Ok(self.inner.world.read_events(run_id, 1).await?)
  }

  /// Append an event and publish it if it was new.
  pub(crate) async fn append(
    &self,
    run_id: &str,
    kind: EventKind,
  ) -> Result<Appended, EngineError> {
    let appended = self
      .inner
      .world
      .append_event(run_id, kind, self.now())
      .await?;
    match &appended {
      Appended::New(event) => {
        let run_event = RunEvent {
          run_id: run_id.to_string(),
          event: event.clone(),
        };
        self.inner.notifier.notify(&run_event);
        // No receivers is fine.
        let _ = self.inner.events.send(run_event);
      }
      Appended::Duplicate => {
        debug!(run_id = %run_id, "event_deduplicated");
      }
    }
    Ok(appended)
  }

  pub(crate) async fn enqueue(
    &self,
    message: QueueMessage,
    deliver_at: DateTime<Utc>,
  ) -> Result<(), EngineError> {
    self.inner.world.enqueue(message, deliver_at).await?;
    self.inner.wakeup.notify_one();
    Ok(())
  }

  /// Queue an advance of `run_id`.
  pub(crate) async fn trigger(&self, run_id: &str) -> Result<(), EngineError> {
    self
      .enqueue(
        QueueMessage::Workflow {
          run_id: run_id.to_string(),
        },
        self.now(),
      )
      .await
  }

  pub(crate) fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
    lock_for(&self.inner.run_locks, run_id)
  }

  /// Serializes stream index allocation within one run.
  pub(crate) fn stream_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
    lock_for(&self.inner.stream_locks, run_id)
  }

  fn forget_locks(&self, run_id: &str) {
    for locks in [&self.inner.run_locks, &self.inner.stream_locks] {
      locks.lock().unwrap_or_else(|e| e.into_inner()).remove(run_id);
    }
  }

  /// Register a hook or webhook token, mapping a conflict to `false`.
  pub(crate) async fn register_token(
    &self,
    record: &ember_world::TokenRecord,
  ) -> Result<bool, EngineError> {
    match self.inner.world.register_token(record).await {
      Ok(()) => Ok(true),
      Err(WorldError::TokenConflict { token, run_id }) => {
        warn!(run_id = %record.run_id, token = %token, held_by = %run_id, "token_conflict");
        Ok(false)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Record a run status change on its projection.
  pub(crate) async fn set_status(&self, run_id: &str, status: RunStatus) -> Result<(), EngineError> {
    let mut run = self.inner.world.get_run(run_id).await?;
    if run.status == status || run.status.is_terminal() {
      return Ok(());
    }
    run.status = status;
    run.updated_at = self.now();
    self.inner.world.update_run(&run).await?;
    debug!(run_id = %run_id, status = %status, "run_status_changed");
    Ok(())
  }
}

fn lock_for(locks: &LockMap, run_id: &str) -> Arc<Mutex<()>> {
  locks
    .lock()
    .unwrap_or_else(|e| e.into_inner())
    .entry(run_id.to_string())
    .or_default()
    .clone()
}
