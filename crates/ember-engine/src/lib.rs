//! Ember Engine
//!
//! Executes durable workflows over a [`World`](ember_world::World).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runner                              │
//! │  - claims due queue messages                                │
//! │  - runs step attempts concurrently (bounded)                │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │  - start / resume_hook / resume_webhook / cancel            │
//! │  - advance: replay orchestrator, persist new calls          │
//! │  - run_step: execute an attempt, record outcome or retry    │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          World                              │
//! │  - run records, event logs, queue, hook tokens              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ember_engine::{Engine, Runner};
//! use ember_world::MemoryWorld;
//! use tokio_util::sync::CancellationToken;
//!
//! let registry = Registry::new()
//!   .workflow(Signup)
//!   .step(CreateUser)
//!   .step(SendEmail);
//! let engine = Engine::new(Arc::new(MemoryWorld::new()), registry);
//!
//! let cancel = CancellationToken::new();
//! tokio::spawn(Runner::new(engine.clone()).start(cancel.clone()));
//!
//! let run = engine.start::<Signup>(&"ada@example.com".to_string()).await?;
//! run.wait().await?;
//! ```

mod config;
mod engine;
mod error;
mod events;
mod inspector;
mod interpreter;
mod retry;
mod run;
mod runner;
mod scheduler;
mod schema;
mod stream;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use events::{ChannelNotifier, EventNotifier, NoopNotifier, RunEvent};
pub use inspector::{Inspector, StepSummary, StreamChunk};
pub use interpreter::Advance;
pub use retry::RetryPolicy;
pub use run::RunHandle;
pub use runner::Runner;
