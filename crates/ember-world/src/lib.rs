//! Ember World
//!
//! This crate provides the durable backend abstraction ("world") for the
//! ember engine and its implementations. A world stores, per run:
//! - the append-only event log (source of truth for replay)
//! - a run record projection for status queries
//! - hook and webhook tokens that address suspended runs
//!
//! and owns a delayed work queue so sleep deadlines and retry delays survive
//! process restarts.
//!
//! Implementations:
//! - [`MemoryWorld`] keeps everything in memory (tests)
//! - [`LocalWorld`] persists to a local directory (development)
//! - [`SqliteWorld`] persists to SQLite through sqlx (production)

mod clock;
mod event;
mod local;
mod memory;
mod sqlite;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event::{Appended, Event, EventKind, Seq};
pub use local::LocalWorld;
pub use memory::MemoryWorld;
pub use sqlite::SqliteWorld;
pub use types::{
  AttemptRecord, Claimed, FailureKind, QueueMessage, ResponseMode, RunFailure, RunRecord,
  RunStatus, StepDiagnostics, StepFailure, TokenKind, TokenRecord, WebhookRequest,
  WebhookResponse,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Error type for world operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
  /// The requested run does not exist.
  #[error("run not found: {0}")]
  RunNotFound(String),

  /// A run with this id already exists.
  #[error("run already exists: {0}")]
  RunExists(String),

  /// No active hook or webhook uses this token.
  #[error("token not found: {0}")]
  TokenNotFound(String),

  /// The token is held by an active, unconsumed suspension.
  #[error("token '{token}' is already active for run '{run_id}'")]
  TokenConflict { token: String, run_id: String },

  /// A single-shot token was already resumed.
  #[error("token already consumed: {0}")]
  TokenConsumed(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Embedded migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  /// An I/O error occurred.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// A record could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

/// Durable storage and queueing capability required by the engine.
///
/// **Invariants every implementation upholds:**
/// - `append_event` assigns strictly increasing `seq` values per run, starting at 1.
/// - Events whose [`EventKind::dedup_key`] already exists in the run are not
///   written; the call reports [`Appended::Duplicate`].
/// - `read_events` returns events in ascending `seq` order.
/// - `consume_token` is atomic: a single-shot token is consumed exactly once.
/// - A claimed queue message is redelivered once its lease expires unless acked.
/// - `enqueue` folds a message into an identical one that has not been claimed
///   yet, keeping the earlier delivery time.
#[async_trait]
pub trait World: Send + Sync {
  /// Create a new run record.
  async fn create_run(&self, run: &RunRecord) -> Result<(), WorldError>;

  /// Get a run record by id.
  async fn get_run(&self, run_id: &str) -> Result<RunRecord, WorldError>;

  /// Replace a run record.
  async fn update_run(&self, run: &RunRecord) -> Result<(), WorldError>;

  /// List all runs, newest first.
  async fn list_runs(&self) -> Result<Vec<RunRecord>, WorldError>;

  /// Remove a run, its events and its tokens.
  async fn delete_run(&self, run_id: &str) -> Result<(), WorldError>;

  /// Append an event to a run's log.
  async fn append_event(
    &self,
    run_id: &str,
    kind: EventKind,
    at: DateTime<Utc>,
  ) -> Result<Appended, WorldError>;

  /// Read a run's events with `seq >= from`.
  async fn read_events(&self, run_id: &str, from: Seq) -> Result<Vec<Event>, WorldError>;

  /// Queue a message for delivery at or after `deliver_at`. Safe to repeat.
  async fn enqueue(&self, message: QueueMessage, deliver_at: DateTime<Utc>)
  -> Result<(), WorldError>;

  /// Claim the earliest message due at `now`, leasing it for `lease`.
  async fn claim_next_ready(
    &self,
    now: DateTime<Utc>,
    lease: Duration,
  ) -> Result<Option<Claimed>, WorldError>;

  /// Remove a claimed message from the queue.
  async fn ack(&self, claim_id: u64) -> Result<(), WorldError>;

  /// Earliest instant at which some queued message becomes claimable.
  async fn next_delivery(&self) -> Result<Option<DateTime<Utc>>, WorldError>;

  /// Arrange for a `Wake` message to be delivered at `at`.
  async fn schedule_wake(
    &self,
    run_id: &str,
    position: u32,
    at: DateTime<Utc>,
  ) -> Result<(), WorldError> {
    self
      .enqueue(
        QueueMessage::Wake {
          run_id: run_id.to_string(),
          position,
        },
        at,
      )
      .await
  }

  /// Register a hook or webhook token.
  ///
  /// Fails with [`WorldError::TokenConflict`] while another unconsumed record
  /// holds the token. Re-registering the same run and position is a no-op.
  async fn register_token(&self, record: &TokenRecord) -> Result<(), WorldError>;

  /// Look up an active token.
  async fn get_token(&self, token: &str) -> Result<TokenRecord, WorldError>;

  /// Mark a token as resumed. Single-shot tokens can be consumed once.
  async fn consume_token(&self, token: &str) -> Result<TokenRecord, WorldError>;

  /// Drop every token owned by a run.
  async fn release_tokens(&self, run_id: &str) -> Result<(), WorldError>;
}
