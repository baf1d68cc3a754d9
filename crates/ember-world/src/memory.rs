use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Appended, Event, EventKind, Seq};
use crate::types::{Claimed, QueueMessage, RunRecord, TokenRecord};
use crate::{World, WorldError};

/// A queued message with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueueItem {
  pub id: u64,
  pub message: QueueMessage,
  pub deliver_at: DateTime<Utc>,
  pub leased_until: Option<DateTime<Utc>>,
}

impl QueueItem {
  /// Instant from which the item can be claimed.
  fn available_at(&self) -> DateTime<Utc> {
    match self.leased_until {
      Some(lease) if lease > self.deliver_at => lease,
      _ => self.deliver_at,
    }
  }
}

/// Persisted form of the queue.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct QueueFile {
  pub next_id: u64,
  pub items: Vec<QueueItem>,
}

/// World state shared by the in-memory and local-file backends.
#[derive(Debug, Default)]
pub(crate) struct MemoryState {
  pub runs: BTreeMap<String, RunRecord>,
  pub events: HashMap<String, Vec<Event>>,
  dedup: HashSet<(String, String)>,
  pub queue: QueueFile,
  pub tokens: HashMap<String, TokenRecord>,
}

impl MemoryState {
  pub fn create_run(&mut self, run: &RunRecord) -> Result<(), WorldError> {
    if self.runs.contains_key(&run.run_id) {
      return Err(WorldError::RunExists(run.run_id.clone()));
    }
    self.runs.insert(run.run_id.clone(), run.clone());
    Ok(())
  }

  pub fn get_run(&self, run_id: &str) -> Result<RunRecord, WorldError> {
    self
      .runs
      .get(run_id)
      .cloned()
      .ok_or_else(|| WorldError::RunNotFound(run_id.to_string()))
  }

  pub fn update_run(&mut self, run: &RunRecord) -> Result<(), WorldError> {
    match self.runs.get_mut(&run.run_id) {
      Some(existing) => {
        *existing = run.clone();
        Ok(())
      }
      None => Err(WorldError::RunNotFound(run.run_id.clone())),
    }
  }

  pub fn list_runs(&self) -> Vec<RunRecord> {
    let mut runs: Vec<RunRecord> = self.runs.values().cloned().collect();
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    runs
  }

  pub fn delete_run(&mut self, run_id: &str) {
    self.runs.remove(run_id);
    self.events.remove(run_id);
    self.dedup.retain(|(id, _)| id != run_id);
    self.tokens.retain(|_, t| t.run_id != run_id);
    self.queue.items.retain(|i| i.message.run_id() != run_id);
  }

  pub fn append_event(&mut self, run_id: &str, kind: EventKind, at: DateTime<Utc>) -> Appended {
    if let Some(key) = kind.dedup_key()
      && !self.dedup.insert((run_id.to_string(), key))
    {
      return Appended::Duplicate;
    }
    let log = self.events.entry(run_id.to_string()).or_default();
    let seq = log.last().map(|e| e.seq + 1).unwrap_or(1);
    let event = Event {
      seq,
      timestamp: at,
      kind,
    };
    log.push(event.clone());
    Appended::New(event)
  }

  /// Rebuild a run's log from persisted events.
  pub fn load_events(&mut self, run_id: &str, events: Vec<Event>) {
    for event in &events {
      if let Some(key) = event.kind.dedup_key() {
        self.dedup.insert((run_id.to_string(), key));
      }
    }
    self.events.insert(run_id.to_string(), events);
  }

  pub fn read_events(&self, run_id: &str, from: Seq) -> Vec<Event> {
    self
      .events
      .get(run_id)
      .map(|log| log.iter().filter(|e| e.seq >= from).cloned().collect())
      .unwrap_or_default()
  }

  /// Queue a message. An identical message that no one has claimed yet
  /// absorbs it, keeping the earlier delivery time.
  pub fn enqueue(&mut self, message: QueueMessage, deliver_at: DateTime<Utc>) {
    if let Some(queued) = self
      .queue
      .items
      .iter_mut()
      .find(|i| i.leased_until.is_none() && i.message == message)
    {
      queued.deliver_at = queued.deliver_at.min(deliver_at);
      return;
    }
    self.queue.next_id += 1;
    self.queue.items.push(QueueItem {
      id: self.queue.next_id,
      message,
      deliver_at,
      leased_until: None,
    });
  }

  pub fn claim_next_ready(&mut self, now: DateTime<Utc>, lease: Duration) -> Option<Claimed> {
    let item = self
      .queue
      .items
      .iter_mut()
      .filter(|i| i.available_at() <= now)
      .min_by_key(|i| (i.deliver_at, i.id))?;
    item.leased_until = Some(now + lease);
    Some(Claimed {
      claim_id: item.id,
      message: item.message.clone(),
    })
  }

  pub fn ack(&mut self, claim_id: u64) {
    self.queue.items.retain(|i| i.id != claim_id);
  }

  pub fn next_delivery(&self) -> Option<DateTime<Utc>> {
    self.queue.items.iter().map(QueueItem::available_at).min()
  }

  pub fn register_token(&mut self, record: &TokenRecord) -> Result<(), WorldError> {
    if let Some(existing) = self.tokens.get(&record.token)
      && !existing.consumed
    {
      if existing.run_id == record.run_id && existing.position == record.position {
        return Ok(());
      }
      return Err(WorldError::TokenConflict {
        token: record.token.clone(),
        run_id: existing.run_id.clone(),
      });
    }
    self.tokens.insert(record.token.clone(), record.clone());
    Ok(())
  }

  pub fn get_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    self
      .tokens
      .get(token)
      .cloned()
      .ok_or_else(|| WorldError::TokenNotFound(token.to_string()))
  }

  pub fn consume_token(&mut self, token: &str) -> Result<TokenRecord, WorldError> {
    let record = self
      .tokens
      .get_mut(token)
      .ok_or_else(|| WorldError::TokenNotFound(token.to_string()))?;
    if record.consumed {
      return Err(WorldError::TokenConsumed(token.to_string()));
    }
    if !record.multi_shot {
      record.consumed = true;
    }
    Ok(record.clone())
  }

  pub fn release_tokens(&mut self, run_id: &str) {
    self.tokens.retain(|_, t| t.run_id != run_id);
  }
}

/// In-memory world. Nothing survives the process; intended for tests.
#[derive(Debug, Default)]
pub struct MemoryWorld {
  state: Mutex<MemoryState>,
}

impl MemoryWorld {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[async_trait]
impl World for MemoryWorld {
  async fn create_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    self.state().create_run(run)
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, WorldError> {
    self.state().get_run(run_id)
  }

  async fn update_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    self.state().update_run(run)
  }

  async fn list_runs(&self) -> Result<Vec<RunRecord>, WorldError> {
    Ok(self.state().list_runs())
  }

  async fn delete_run(&self, run_id: &str) -> Result<(), WorldError> {
    self.state().delete_run(run_id);
    Ok(())
  }

  async fn append_event(
    &self,
    run_id: &str,
    kind: EventKind,
    at: DateTime<Utc>,
  ) -> Result<Appended, WorldError> {
    Ok(self.state().append_event(run_id, kind, at))
  }

  async fn read_events(&self, run_id: &str, from: Seq) -> Result<Vec<Event>, WorldError> {
    Ok(self.state().read_events(run_id, from))
  }

  async fn enqueue(
    &self,
    message: QueueMessage,
    deliver_at: DateTime<Utc>,
  ) -> Result<(), WorldError> {
    self.state().enqueue(message, deliver_at);
    Ok(())
  }

  async fn claim_next_ready(
    &self,
    now: DateTime<Utc>,
    lease: Duration,
  ) -> Result<Option<Claimed>, WorldError> {
    Ok(self.state().claim_next_ready(now, lease))
  }

  async fn ack(&self, claim_id: u64) -> Result<(), WorldError> {
    self.state().ack(claim_id);
    Ok(())
  }

  async fn next_delivery(&self) -> Result<Option<DateTime<Utc>>, WorldError> {
    Ok(self.state().next_delivery())
  }

  async fn register_token(&self, record: &TokenRecord) -> Result<(), WorldError> {
    self.state().register_token(record)
  }

  async fn get_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    self.state().get_token(token)
  }

  async fn consume_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    self.state().consume_token(token)
  }

  async fn release_tokens(&self, run_id: &str) -> Result<(), WorldError> {
    self.state().release_tokens(run_id);
    Ok(())
  }
}
