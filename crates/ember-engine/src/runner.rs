//! Queue-driven background runner.
//!
//! The `Runner` claims due queue messages from the engine's world and
//! processes them. Step attempts run concurrently, bounded by
//! `EngineConfig::max_concurrent_steps`; orchestrator advances and wakes
//! are processed inline.

use std::sync::Arc;

use ember_world::{Claimed, QueueMessage};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::error::EngineError;

/// Processes an engine's queue until cancelled.
///
/// # Usage
///
/// ```ignore
/// let runner = Runner::new(engine.clone());
/// let cancel = CancellationToken::new();
/// tokio::spawn(runner.start(cancel.clone()));
///
/// let run = engine.start::<Signup>(&email).await?;
/// let output = run.wait().await?;
/// cancel.cancel();
/// ```
pub struct Runner {
  engine: Engine,
}

impl Runner {
  pub fn new(engine: Engine) -> Self {
    Self { engine }
  }

  /// Run the processing loop until `cancel` fires, then wait for in-flight
  /// step attempts to finish.
  pub async fn start(self, cancel: CancellationToken) -> Result<(), EngineError> {
    let config = self.engine.config().clone();
    let permits = Arc::new(Semaphore::new(config.max_concurrent_steps.max(1)));
    let mut tasks = JoinSet::new();

    info!(
      max_concurrent_steps = config.max_concurrent_steps,
      "runner_started"
    );

    loop {
      while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
          error!(error = %e, "step_task_panicked");
        }
      }

      let permit = tokio::select! {
        _ = cancel.cancelled() => break,
        permit = permits.clone().acquire_owned() => match permit {
          Ok(permit) => permit,
          Err(_) => break,
        },
      };

      let now = self.engine.now();
      match self
        .engine
        .world()
        .claim_next_ready(now, config.lease())
        .await
      {
        Ok(Some(claimed)) => self.dispatch(claimed, permit, &mut tasks).await,
        Ok(None) => {
          drop(permit);
          if !self.idle(&cancel).await {
            break;
          }
        }
        Err(e) => {
          drop(permit);
          error!(error = %e, "queue_claim_failed");
          tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval()) => {}
          }
        }
      }
    }

    let in_flight = tasks.len();
    while let Some(joined) = tasks.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "step_task_panicked");
      }
    }
    info!(in_flight, "runner_stopped");
    Ok(())
  }

  async fn dispatch(
    &self,
    claimed: Claimed,
    permit: OwnedSemaphorePermit,
    tasks: &mut JoinSet<()>,
  ) {
    match claimed.message {
      QueueMessage::Step { .. } => {
        let engine = self.engine.clone();
        tasks.spawn(async move {
          process_and_ack(&engine, claimed).await;
          drop(permit);
        });
      }
      QueueMessage::Workflow { .. } | QueueMessage::Wake { .. } => {
        drop(permit);
        process_and_ack(&self.engine, claimed).await;
      }
    }
  }

  /// Sleep until new work is queued, the next delayed message is due, or
  /// the poll interval passes. Returns `false` when cancelled.
  async fn idle(&self, cancel: &CancellationToken) -> bool {
    let poll = self.engine.config().poll_interval();
    let wait = match self.engine.world().next_delivery().await {
      Ok(Some(at)) => (at - self.engine.now())
        .to_std()
        .map_or(std::time::Duration::ZERO, |d| d.min(poll)),
      Ok(None) => poll,
      Err(e) => {
        error!(error = %e, "queue_peek_failed");
        poll
      }
    };

    tokio::select! {
      _ = cancel.cancelled() => false,
      _ = self.engine.inner.wakeup.notified() => true,
      _ = tokio::time::sleep(wait) => true,
    }
  }
}

async fn process_and_ack(engine: &Engine, claimed: Claimed) {
  let run_id = claimed.message.run_id().to_string();
  match engine.process(&claimed.message).await {
    Ok(()) => {
      if let Err(e) = engine.world().ack(claimed.claim_id).await {
        error!(run_id = %run_id, error = %e, "queue_ack_failed");
      }
    }
    Err(e) => {
      // Left unacked; redelivered once the lease expires.
      error!(run_id = %run_id, error = %e, "message_failed");
    }
  }
  debug!(run_id = %run_id, claim_id = claimed.claim_id, "message_processed");
}
