use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::event::{Appended, Event, EventKind, Seq};
use crate::memory::{MemoryState, QueueFile};
use crate::types::{Claimed, QueueMessage, RunRecord, TokenRecord};
use crate::{World, WorldError};

/// World persisted as plain files under a directory.
///
/// Layout:
/// - `runs/{run_id}.json`     run record
/// - `events/{run_id}.jsonl`  one event per line, append-only
/// - `queue.json`             pending queue messages
/// - `tokens.json`            active tokens
///
/// All state is loaded on open and kept in memory; every mutation is written
/// through before the call returns.
pub struct LocalWorld {
  root: PathBuf,
  state: Mutex<MemoryState>,
}

impl LocalWorld {
  /// Open (or create) a world rooted at `root`.
  pub async fn open(root: impl Into<PathBuf>) -> Result<Self, WorldError> {
    let root = root.into();
    tokio::fs::create_dir_all(root.join("runs")).await?;
    tokio::fs::create_dir_all(root.join("events")).await?;

    let mut state = MemoryState::default();

    let mut runs = tokio::fs::read_dir(root.join("runs")).await?;
    while let Some(entry) = runs.next_entry().await? {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      let data = tokio::fs::read(&path).await?;
      let run: RunRecord = serde_json::from_slice(&data)?;
      state.runs.insert(run.run_id.clone(), run);
    }

    let mut logs = tokio::fs::read_dir(root.join("events")).await?;
    while let Some(entry) = logs.next_entry().await? {
      let path = entry.path();
      if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
        continue;
      }
      let Some(run_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
        continue;
      };
      let data = tokio::fs::read_to_string(&path).await?;
      let events = data
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<Event>)
        .collect::<Result<Vec<_>, _>>()?;
      state.load_events(&run_id, events);
    }

    if let Some(data) = read_optional(&root.join("queue.json")).await? {
      state.queue = serde_json::from_slice::<QueueFile>(&data)?;
    }
    if let Some(data) = read_optional(&root.join("tokens.json")).await? {
      let tokens: Vec<TokenRecord> = serde_json::from_slice(&data)?;
      state.tokens = tokens.into_iter().map(|t| (t.token.clone(), t)).collect();
    }

    debug!(
      root = %root.display(),
      runs = state.runs.len(),
      queued = state.queue.items.len(),
      "local_world_opened"
    );

    Ok(Self {
      root,
      state: Mutex::new(state),
    })
  }

  /// Directory this world persists to.
  pub fn root(&self) -> &Path {
    &self.root
  }

  fn run_path(&self, run_id: &str) -> PathBuf {
    self.root.join("runs").join(format!("{run_id}.json"))
  }

  fn events_path(&self, run_id: &str) -> PathBuf {
    self.root.join("events").join(format!("{run_id}.jsonl"))
  }

  async fn write_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    write_atomic(&self.run_path(&run.run_id), &serde_json::to_vec_pretty(run)?).await
  }

  async fn write_queue(&self, state: &MemoryState) -> Result<(), WorldError> {
    write_atomic(&self.root.join("queue.json"), &serde_json::to_vec(&state.queue)?).await
  }

  async fn write_tokens(&self, state: &MemoryState) -> Result<(), WorldError> {
    let tokens: Vec<&TokenRecord> = state.tokens.values().collect();
    write_atomic(&self.root.join("tokens.json"), &serde_json::to_vec(&tokens)?).await
  }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, WorldError> {
  match tokio::fs::read(path).await {
    Ok(data) => Ok(Some(data)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}

async fn remove_optional(path: &Path) -> Result<(), WorldError> {
  match tokio::fs::remove_file(path).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

/// Write via a temp file and rename so readers never see partial content.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), WorldError> {
  let tmp = path.with_extension("tmp");
  tokio::fs::write(&tmp, data).await?;
  tokio::fs::rename(&tmp, path).await?;
  Ok(())
}

#[async_trait]
impl World for LocalWorld {
  async fn create_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.create_run(run)?;
    self.write_run(run).await
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, WorldError> {
    self.state.lock().await.get_run(run_id)
  }

  async fn update_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.update_run(run)?;
    self.write_run(run).await
  }

  async fn list_runs(&self) -> Result<Vec<RunRecord>, WorldError> {
    Ok(self.state.lock().await.list_runs())
  }

  async fn delete_run(&self, run_id: &str) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.delete_run(run_id);
    remove_optional(&self.run_path(run_id)).await?;
    remove_optional(&self.events_path(run_id)).await?;
    self.write_queue(&state).await?;
    self.write_tokens(&state).await
  }

  async fn append_event(
    &self,
    run_id: &str,
    kind: EventKind,
    at: DateTime<Utc>,
  ) -> Result<Appended, WorldError> {
    let mut state = self.state.lock().await;
    let appended = state.append_event(run_id, kind, at);
    if let Appended::New(event) = &appended {
      let mut line = serde_json::to_vec(event)?;
      line.push(b'\n');
      let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(self.events_path(run_id))
        .await?;
      file.write_all(&line).await?;
      file.flush().await?;
    }
    Ok(appended)
  }

  async fn read_events(&self, run_id: &str, from: Seq) -> Result<Vec<Event>, WorldError> {
    Ok(self.state.lock().await.read_events(run_id, from))
  }

  async fn enqueue(
    &self,
    message: QueueMessage,
    deliver_at: DateTime<Utc>,
  ) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.enqueue(message, deliver_at);
    self.write_queue(&state).await
  }

  async fn claim_next_ready(
    &self,
    now: DateTime<Utc>,
    lease: Duration,
  ) -> Result<Option<Claimed>, WorldError> {
    let mut state = self.state.lock().await;
    let claimed = state.claim_next_ready(now, lease);
    if claimed.is_some() {
      self.write_queue(&state).await?;
    }
    Ok(claimed)
  }

  async fn ack(&self, claim_id: u64) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.ack(claim_id);
    self.write_queue(&state).await
  }

  async fn next_delivery(&self) -> Result<Option<DateTime<Utc>>, WorldError> {
    Ok(self.state.lock().await.next_delivery())
  }

  async fn register_token(&self, record: &TokenRecord) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.register_token(record)?;
    self.write_tokens(&state).await
  }

  async fn get_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    self.state.lock().await.get_token(token)
  }

  async fn consume_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    let mut state = self.state.lock().await;
    let record = state.consume_token(token)?;
    self.write_tokens(&state).await?;
    Ok(record)
  }

  async fn release_tokens(&self, run_id: &str) -> Result<(), WorldError> {
    let mut state = self.state.lock().await;
    state.release_tokens(run_id);
    self.write_tokens(&state).await
  }
}
