use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::event::{Appended, Event, EventKind, Seq};
use crate::types::{Claimed, QueueMessage, RunRecord, TokenRecord};
use crate::{World, WorldError};

/// SQLite-based world implementation.
pub struct SqliteWorld {
  pool: SqlitePool,
}

impl SqliteWorld {
  /// Create a new SQLite world with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open the database file at `path`, creating it if needed, and migrate it.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, WorldError> {
    let options = SqliteConnectOptions::new()
      .filename(path.as_ref())
      .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    let world = Self::new(pool);
    world.migrate().await?;
    Ok(world)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), WorldError> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }
}

fn micros(at: DateTime<Utc>) -> i64 {
  at.timestamp_micros()
}

fn from_micros(value: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_micros(value).unwrap_or_default()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
  matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn token_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TokenRecord, WorldError> {
  let record: String = row.try_get("record")?;
  let consumed: bool = row.try_get("consumed")?;
  let mut token: TokenRecord = serde_json::from_str(&record)?;
  token.consumed = consumed;
  Ok(token)
}

#[async_trait]
impl World for SqliteWorld {
  async fn create_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    let result = sqlx::query(
      r#"
      INSERT INTO runs (run_id, workflow, status, created_at, record)
      VALUES (?, ?, ?, ?, ?)
      "#,
    )
    .bind(&run.run_id)
    .bind(&run.workflow)
    .bind(run.status.as_str())
    .bind(micros(run.created_at))
    .bind(serde_json::to_string(run)?)
    .execute(&self.pool)
    .await;

    match result {
      Ok(_) => Ok(()),
      Err(e) if is_unique_violation(&e) => Err(WorldError::RunExists(run.run_id.clone())),
      Err(e) => Err(e.into()),
    }
  }

  async fn get_run(&self, run_id: &str) -> Result<RunRecord, WorldError> {
    let row = sqlx::query("SELECT record FROM runs WHERE run_id = ?")
      .bind(run_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| WorldError::RunNotFound(run_id.to_string()))?;
    let record: String = row.try_get("record")?;
    Ok(serde_json::from_str(&record)?)
  }

  async fn update_run(&self, run: &RunRecord) -> Result<(), WorldError> {
    let result = sqlx::query(
      r#"
      UPDATE runs
      SET status = ?, record = ?
      WHERE run_id = ?
      "#,
    )
    .bind(run.status.as_str())
    .bind(serde_json::to_string(run)?)
    .bind(&run.run_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(WorldError::RunNotFound(run.run_id.clone()));
    }
    Ok(())
  }

  async fn list_runs(&self) -> Result<Vec<RunRecord>, WorldError> {
    let rows = sqlx::query("SELECT record FROM runs ORDER BY created_at DESC, run_id")
      .fetch_all(&self.pool)
      .await?;
    rows
      .iter()
      .map(|row| {
        let record: String = row.try_get("record")?;
        Ok(serde_json::from_str(&record)?)
      })
      .collect()
  }

  async fn delete_run(&self, run_id: &str) -> Result<(), WorldError> {
    let mut tx = self.pool.begin().await?;
    for statement in [
      "DELETE FROM runs WHERE run_id = ?",
      "DELETE FROM events WHERE run_id = ?",
      "DELETE FROM queue WHERE run_id = ?",
      "DELETE FROM tokens WHERE run_id = ?",
    ] {
      sqlx::query(statement)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
  }

  async fn append_event(
    &self,
    run_id: &str,
    kind: EventKind,
    at: DateTime<Utc>,
  ) -> Result<Appended, WorldError> {
    let payload = serde_json::to_string(&kind)?;
    let row = sqlx::query(
      r#"
      INSERT INTO events (run_id, seq, dedup_key, timestamp, kind)
      SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?
      FROM events
      WHERE run_id = ?
      ON CONFLICT DO NOTHING
      RETURNING seq
      "#,
    )
    .bind(run_id)
    .bind(kind.dedup_key())
    .bind(at)
    .bind(payload)
    .bind(run_id)
    .fetch_optional(&self.pool)
    .await?;

    match row {
      Some(row) => {
        let seq: i64 = row.try_get("seq")?;
        Ok(Appended::New(Event {
          seq: seq as Seq,
          timestamp: at,
          kind,
        }))
      }
      None => Ok(Appended::Duplicate),
    }
  }

  async fn read_events(&self, run_id: &str, from: Seq) -> Result<Vec<Event>, WorldError> {
    let rows = sqlx::query(
      r#"
      SELECT seq, timestamp, kind
      FROM events
      WHERE run_id = ? AND seq >= ?
      ORDER BY seq
      "#,
    )
    .bind(run_id)
    .bind(from as i64)
    .fetch_all(&self.pool)
    .await?;

    rows
      .iter()
      .map(|row| {
        let seq: i64 = row.try_get("seq")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
        let kind: String = row.try_get("kind")?;
        Ok(Event {
          seq: seq as Seq,
          timestamp,
          kind: serde_json::from_str(&kind)?,
        })
      })
      .collect()
  }

  async fn enqueue(
    &self,
    message: QueueMessage,
    deliver_at: DateTime<Utc>,
  ) -> Result<(), WorldError> {
    let encoded = serde_json::to_string(&message)?;
    let mut tx = self.pool.begin().await?;
    // An identical unclaimed message absorbs this one.
    let merged = sqlx::query(
      "UPDATE queue SET deliver_at = MIN(deliver_at, ?) WHERE message = ? AND leased_until IS NULL",
    )
    .bind(micros(deliver_at))
    .bind(&encoded)
    .execute(&mut *tx)
    .await?;
    if merged.rows_affected() == 0 {
      sqlx::query("INSERT INTO queue (run_id, message, deliver_at) VALUES (?, ?, ?)")
        .bind(message.run_id())
        .bind(&encoded)
        .bind(micros(deliver_at))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
  }

  async fn claim_next_ready(
    &self,
    now: DateTime<Utc>,
    lease: Duration,
  ) -> Result<Option<Claimed>, WorldError> {
    let now = micros(now);
    let row = sqlx::query(
      r#"
      UPDATE queue
      SET leased_until = ?
      WHERE id = (
        SELECT id FROM queue
        WHERE deliver_at <= ? AND (leased_until IS NULL OR leased_until <= ?)
        ORDER BY deliver_at, id
        LIMIT 1
      )
      RETURNING id, message
      "#,
    )
    .bind(now + lease.num_microseconds().unwrap_or(i64::MAX / 2))
    .bind(now)
    .bind(now)
    .fetch_optional(&self.pool)
    .await?;

    let Some(row) = row else {
      return Ok(None);
    };
    let id: i64 = row.try_get("id")?;
    let message: String = row.try_get("message")?;
    Ok(Some(Claimed {
      claim_id: id as u64,
      message: serde_json::from_str(&message)?,
    }))
  }

  async fn ack(&self, claim_id: u64) -> Result<(), WorldError> {
    sqlx::query("DELETE FROM queue WHERE id = ?")
      .bind(claim_id as i64)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn next_delivery(&self) -> Result<Option<DateTime<Utc>>, WorldError> {
    let row = sqlx::query(
      "SELECT MIN(MAX(deliver_at, COALESCE(leased_until, deliver_at))) AS next FROM queue",
    )
    .fetch_one(&self.pool)
    .await?;
    let next: Option<i64> = row.try_get("next")?;
    Ok(next.map(from_micros))
  }

  async fn register_token(&self, record: &TokenRecord) -> Result<(), WorldError> {
    let result = sqlx::query(
      r#"
      INSERT INTO tokens (token, run_id, position, multi_shot, consumed, record)
      VALUES (?, ?, ?, ?, ?, ?)
      ON CONFLICT (token) DO UPDATE SET
        run_id = excluded.run_id,
        position = excluded.position,
        multi_shot = excluded.multi_shot,
        consumed = excluded.consumed,
        record = excluded.record
      WHERE tokens.consumed = 1
      "#,
    )
    .bind(&record.token)
    .bind(&record.run_id)
    .bind(record.position as i64)
    .bind(record.multi_shot)
    .bind(record.consumed)
    .bind(serde_json::to_string(record)?)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() > 0 {
      return Ok(());
    }

    let existing = self.get_token(&record.token).await?;
    if existing.run_id == record.run_id && existing.position == record.position {
      return Ok(());
    }
    Err(WorldError::TokenConflict {
      token: record.token.clone(),
      run_id: existing.run_id,
    })
  }

  async fn get_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    let row = sqlx::query("SELECT consumed, record FROM tokens WHERE token = ?")
      .bind(token)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| WorldError::TokenNotFound(token.to_string()))?;
    token_from_row(&row)
  }

  async fn consume_token(&self, token: &str) -> Result<TokenRecord, WorldError> {
    let mut record = self.get_token(token).await?;
    if record.consumed {
      return Err(WorldError::TokenConsumed(token.to_string()));
    }
    if record.multi_shot {
      return Ok(record);
    }

    record.consumed = true;
    let result = sqlx::query(
      r#"
      UPDATE tokens
      SET consumed = 1, record = ?
      WHERE token = ? AND run_id = ? AND consumed = 0
      "#,
    )
    .bind(serde_json::to_string(&record)?)
    .bind(token)
    .bind(&record.run_id)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      return Err(WorldError::TokenConsumed(token.to_string()));
    }
    Ok(record)
  }

  async fn release_tokens(&self, run_id: &str) -> Result<(), WorldError> {
    sqlx::query("DELETE FROM tokens WHERE run_id = ?")
      .bind(run_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}
