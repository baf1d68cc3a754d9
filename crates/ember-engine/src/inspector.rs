//! Read-only views over a world, for tooling.

use std::sync::Arc;

use ember_workflow::{Call, History, StepOutcome};
use ember_world::{AttemptRecord, Event, EventKind, RunRecord, RunStatus, World, WorldError};
use serde::Serialize;

/// State of one step call of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
  pub position: u32,
  pub step_id: String,
  pub step: String,
  /// Highest attempt started.
  pub attempts: u32,
  pub failures: Vec<AttemptRecord>,
  /// `pending`, `completed` or `failed`.
  pub status: &'static str,
}

/// One chunk of an output stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamChunk {
  pub index: u64,
  pub chunk: serde_json::Value,
}

/// Queries runs without driving them. Safe to point at a world another
/// process is executing.
#[derive(Clone)]
pub struct Inspector {
  world: Arc<dyn World>,
}

impl Inspector {
  pub fn new(world: Arc<dyn World>) -> Self {
    Self { world }
  }

  /// Runs, newest first, optionally filtered by status.
  pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunRecord>, WorldError> {
    let runs = self.world.list_runs().await?;
    Ok(match status {
      Some(status) => runs.into_iter().filter(|r| r.status == status).collect(),
      None => runs,
    })
  }

  pub async fn run(&self, run_id: &str) -> Result<RunRecord, WorldError> {
    self.world.get_run(run_id).await
  }

  pub async fn events(&self, run_id: &str) -> Result<Vec<Event>, WorldError> {
    self.world.get_run(run_id).await?;
    self.world.read_events(run_id, 1).await
  }

  /// Every step call of a run, in call order.
  pub async fn steps(&self, run_id: &str) -> Result<Vec<StepSummary>, WorldError> {
    let history = History::from_events(&self.events(run_id).await?);
    let steps = history
      .calls()
      .filter_map(|(position, call)| match call {
        Call::Step(step) => Some(StepSummary {
          position,
          step_id: step.step_id.clone(),
          step: step.step.clone(),
          attempts: history.started_attempts(&step.step_id),
          failures: history.attempts(&step.step_id).to_vec(),
          status: match step.outcome {
            None => "pending",
            Some(StepOutcome::Completed(_)) => "completed",
            Some(StepOutcome::Failed(_)) => "failed",
          },
        }),
        _ => None,
      })
      .collect();
    Ok(steps)
  }

  /// Chunks of stream `namespace` with index at least `from`.
  pub async fn stream_chunks(
    &self,
    run_id: &str,
    namespace: &str,
    from: u64,
  ) -> Result<Vec<StreamChunk>, WorldError> {
    let chunks = self
      .events(run_id)
      .await?
      .into_iter()
      .filter_map(|event| match event.kind {
        EventKind::StreamWrite {
          namespace: ns,
          index,
          chunk,
        } if ns == namespace && index >= from => Some(StreamChunk { index, chunk }),
        _ => None,
      })
      .collect();
    Ok(chunks)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use ember_world::{MemoryWorld, StepFailure, FailureKind};
  use serde_json::json;

  async fn seeded() -> (Inspector, Arc<MemoryWorld>) {
    let world = Arc::new(MemoryWorld::new());
    let now = Utc::now();
    world
      .create_run(&RunRecord::new("run_1", "demo", json!(null), now))
      .await
      .unwrap();
    let kinds = vec![
      EventKind::RunCreated {
        workflow: "demo".to_string(),
        input: json!(null),
      },
      EventKind::StepScheduled {
        position: 0,
        step_id: "0:fetch".to_string(),
        step: "fetch".to_string(),
        args: json!(1),
        max_retries: 1,
        responds_to: None,
      },
      EventKind::StepStarted {
        step_id: "0:fetch".to_string(),
        attempt: 1,
      },
      EventKind::StepFailed {
        step_id: "0:fetch".to_string(),
        attempt: 1,
        failure: StepFailure {
          kind: FailureKind::Fatal,
          message: "gone".to_string(),
        },
      },
      EventKind::StreamWrite {
        namespace: "log".to_string(),
        index: 0,
        chunk: json!("a"),
      },
      EventKind::StreamWrite {
        namespace: "log".to_string(),
        index: 1,
        chunk: json!("b"),
      },
    ];
    for kind in kinds {
      world.append_event("run_1", kind, now).await.unwrap();
    }
    (Inspector::new(world.clone()), world)
  }

  #[tokio::test]
  async fn test_steps_summarises_attempts() {
    let (inspector, _world) = seeded().await;
    let steps = inspector.steps("run_1").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step, "fetch");
    assert_eq!(steps[0].attempts, 1);
    assert_eq!(steps[0].status, "failed");
    assert_eq!(steps[0].failures[0].error, "gone");
  }

  #[tokio::test]
  async fn test_stream_chunks_from_index() {
    let (inspector, _world) = seeded().await;
    let chunks = inspector.stream_chunks("run_1", "log", 1).await.unwrap();
    assert_eq!(
      chunks,
      vec![StreamChunk {
        index: 1,
        chunk: json!("b")
      }]
    );
  }

  #[tokio::test]
  async fn test_list_runs_filters_by_status() {
    let (inspector, _world) = seeded().await;
    assert_eq!(inspector.list_runs(Some(RunStatus::Running)).await.unwrap().len(), 1);
    assert!(inspector.list_runs(Some(RunStatus::Failed)).await.unwrap().is_empty());
    assert!(matches!(
      inspector.events("run_missing").await,
      Err(WorldError::RunNotFound(_))
    ));
  }
}
