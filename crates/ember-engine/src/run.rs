//! Handles to started runs.

use ember_world::{Event, RunFailure, RunRecord, RunStatus};
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::interpreter::{Advance, terminal_advance};

/// A started run.
#[derive(Clone)]
pub struct RunHandle {
  engine: Engine,
  run_id: String,
}

impl RunHandle {
  pub(crate) fn new(engine: Engine, run_id: String) -> Self {
    Self { engine, run_id }
  }

  pub fn id(&self) -> &str {
    &self.run_id
  }

  pub async fn status(&self) -> Result<RunStatus, EngineError> {
    Ok(self.record().await?.status)
  }

  pub async fn record(&self) -> Result<RunRecord, EngineError> {
    Ok(self.engine.inner.world.get_run(&self.run_id).await?)
  }

  /// The run's full event log.
  pub async fn events(&self) -> Result<Vec<Event>, EngineError> {
    self.engine.events(&self.run_id).await
  }

  /// Terminal error of a failed or cancelled run.
  pub async fn failure(&self) -> Result<Option<RunFailure>, EngineError> {
    Ok(self.record().await?.failure)
  }

  /// Stream `namespace` from its first chunk.
  pub fn readable(&self, namespace: &str) -> BoxStream<'static, Result<serde_json::Value, EngineError>> {
    self.engine.readable(&self.run_id, namespace, 0)
  }

  /// Stream `namespace` from chunk `start_index`.
  pub fn readable_from(
    &self,
    namespace: &str,
    start_index: u64,
  ) -> BoxStream<'static, Result<serde_json::Value, EngineError>> {
    self.engine.readable(&self.run_id, namespace, start_index)
  }

  /// Wait until the run finishes and return its output.
  ///
  /// Work must be driven elsewhere, by a `Runner` or `run_until_idle`.
  pub async fn wait(&self) -> Result<serde_json::Value, EngineError> {
    let mut events = self.engine.subscribe();
    loop {
      let history = self.engine.history(&self.run_id).await?;
      match terminal_advance(&history) {
        Some(Advance::Complete(output)) => return Ok(output),
        Some(Advance::Fail(failure)) => {
          return Err(EngineError::RunFailed {
            run_id: self.run_id.clone(),
            failure,
          });
        }
        Some(Advance::Continue | Advance::Suspend(_)) | None => {}
      }

      loop {
        match events.recv().await {
          Ok(event) if event.run_id == self.run_id => break,
          Ok(_) => continue,
          Err(RecvError::Lagged(_)) => break,
          Err(RecvError::Closed) => {
            return Err(EngineError::RunNotFound {
              run_id: self.run_id.clone(),
            });
          }
        }
      }
    }
  }

  /// Like [`wait`](Self::wait), decoding the output.
  pub async fn wait_for<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
    Ok(serde_json::from_value(self.wait().await?)?)
  }
}

impl std::fmt::Debug for RunHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RunHandle")
      .field("run_id", &self.run_id)
      .finish()
  }
}
