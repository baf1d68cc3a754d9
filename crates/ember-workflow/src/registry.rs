//! Workflow and step traits and the name registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::WorkflowContext;
use crate::error::{StepError, WorkflowError};
use crate::step::StepContext;

/// A replay-safe orchestrator.
///
/// `run` is re-executed from the start on every advance, so it must be a
/// pure function of its input and the values returned by `ctx`. All I/O,
/// clock reads and randomness belong in steps.
pub trait Workflow: Send + Sync + 'static {
  const NAME: &'static str;
  type Input: Serialize + DeserializeOwned + Send;
  type Output: Serialize + DeserializeOwned + Send;

  fn run(&self, ctx: &mut WorkflowContext, input: Self::Input)
  -> Result<Self::Output, WorkflowError>;
}

/// An effectful unit of work, retried independently of its orchestrator.
#[async_trait]
pub trait Step: Send + Sync + 'static {
  const NAME: &'static str;
  /// Retries after the first attempt. 0 disables retries.
  const MAX_RETRIES: u32 = 3;
  type Input: Serialize + DeserializeOwned + Send + Sync;
  type Output: Serialize + DeserializeOwned + Send;

  async fn run(&self, ctx: &StepContext, input: Self::Input) -> Result<Self::Output, StepError>;
}

/// Object-safe form of [`Workflow`] over JSON values.
pub trait ErasedWorkflow: Send + Sync {
  fn name(&self) -> &'static str;

  fn run(
    &self,
    ctx: &mut WorkflowContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, WorkflowError>;
}

struct WorkflowAdapter<W>(W);

impl<W: Workflow> ErasedWorkflow for WorkflowAdapter<W> {
  fn name(&self) -> &'static str {
    W::NAME
  }

  fn run(
    &self,
    ctx: &mut WorkflowContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, WorkflowError> {
    let input: W::Input = serde_json::from_value(input)?;
    let output = self.0.run(ctx, input)?;
    Ok(serde_json::to_value(output)?)
  }
}

/// Object-safe form of [`Step`] over JSON values.
#[async_trait]
pub trait ErasedStep: Send + Sync {
  fn name(&self) -> &'static str;

  fn max_retries(&self) -> u32;

  async fn run(
    &self,
    ctx: &StepContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, StepError>;
}

struct StepAdapter<S>(S);

#[async_trait]
impl<S: Step> ErasedStep for StepAdapter<S> {
  fn name(&self) -> &'static str {
    S::NAME
  }

  fn max_retries(&self) -> u32 {
    S::MAX_RETRIES
  }

  async fn run(
    &self,
    ctx: &StepContext,
    input: serde_json::Value,
  ) -> Result<serde_json::Value, StepError> {
    let input: S::Input = serde_json::from_value(input)?;
    let output = self.0.run(ctx, input).await?;
    Ok(serde_json::to_value(output)?)
  }
}

/// Registered workflows and steps, by name.
#[derive(Clone, Default)]
pub struct Registry {
  workflows: HashMap<&'static str, Arc<dyn ErasedWorkflow>>,
  steps: HashMap<&'static str, Arc<dyn ErasedStep>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register an orchestrator.
  pub fn workflow<W: Workflow>(mut self, workflow: W) -> Self {
    self
      .workflows
      .insert(W::NAME, Arc::new(WorkflowAdapter(workflow)));
    self
  }

  /// Register a step.
  pub fn step<S: Step>(mut self, step: S) -> Self {
    self.steps.insert(S::NAME, Arc::new(StepAdapter(step)));
    self
  }

  pub fn get_workflow(&self, name: &str) -> Option<Arc<dyn ErasedWorkflow>> {
    self.workflows.get(name).cloned()
  }

  pub fn get_step(&self, name: &str) -> Option<Arc<dyn ErasedStep>> {
    self.steps.get(name).cloned()
  }

  pub fn workflow_names(&self) -> impl Iterator<Item = &'static str> + '_ {
    self.workflows.keys().copied()
  }
}
