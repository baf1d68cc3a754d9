//! Ember Workflow
//!
//! Authoring surface for durable workflows:
//! - [`Workflow`] orchestrators are replay-safe and synchronous. They only
//!   see a [`WorkflowContext`], which exposes steps, sleeps, hooks and
//!   webhooks but no I/O.
//! - [`Step`]s are async, effectful and retried. They see a [`StepContext`],
//!   which exposes streams and webhook responses but cannot suspend.
//!
//! The split is enforced by the types: an orchestrator has no way to reach
//! a `StepContext`, and a step has no way to reach a `WorkflowContext`.
//!
//! # Example
//!
//! ```ignore
//! struct Signup;
//!
//! impl Workflow for Signup {
//!   const NAME: &'static str = "signup";
//!   type Input = String;
//!   type Output = ();
//!
//!   fn run(&self, ctx: &mut WorkflowContext, email: String) -> Result<(), WorkflowError> {
//!     let user = ctx.step::<CreateUser>(&email)?;
//!     ctx.step::<SendEmail>(&(user.id.clone(), "welcome".to_string()))?;
//!     ctx.sleep(chrono::Duration::days(3))?;
//!     ctx.step::<SendEmail>(&(user.id, "follow-up".to_string()))?;
//!     Ok(())
//!   }
//! }
//! ```

mod context;
mod error;
mod history;
mod registry;
mod step;

pub use context::{
  Blocked, Hook, HookOptions, Outcome, PendingCall, StepOptions, Webhook, WebhookOptions,
  WorkflowContext,
};
pub use error::{RetryAfter, StepError, WorkflowError};
pub use history::{Call, History, HookCall, SleepCall, StepCall, StepOutcome, StreamState, WebhookCall};
pub use registry::{ErasedStep, ErasedWorkflow, Registry, Step, Workflow};
pub use step::{StepContext, StepEffects, StreamWriter};

/// Run an orchestrator once against `history`.
///
/// Pure: performs no I/O and never touches a world.
pub fn replay(
  workflow: &dyn ErasedWorkflow,
  run_id: &str,
  history: History,
  now: chrono::DateTime<chrono::Utc>,
) -> Outcome {
  let input = history.input().clone();
  let mut ctx = WorkflowContext::new(run_id, history, now);
  let result = workflow.run(&mut ctx, input);
  ctx.finish(result)
}
