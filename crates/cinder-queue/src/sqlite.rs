use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;

use crate::error::QueueError;
use crate::store::SessionStore;
use crate::types::{
  NewSession, QueueStatus, SessionError, SessionRecord, SessionResults, SessionState,
};

/// SQLite-backed session store.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a store over an existing pool. Call [`migrate`](Self::migrate)
  /// before use.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (or create) the database file at `path` and run migrations.
  pub async fn open(path: &Path) -> Result<Self, QueueError> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A private in-memory database, mostly for tests.
  pub async fn in_memory() -> Result<Self, QueueError> {
    // Every connection to :memory: is its own database, so keep exactly one.
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }

  pub async fn close(&self) {
    self.pool.close().await;
  }
}

#[async_trait]
impl SessionStore for SqliteStore {
  async fn insert(&self, session: &NewSession) -> Result<(), QueueError> {
    sqlx::query(
      r#"
            INSERT INTO sessions (session_id, queue_id, state, priority, graph, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&session.session_id)
    .bind(&session.queue_id)
    .bind(SessionState::Queued)
    .bind(session.priority)
    .bind(Json(&session.graph))
    .bind(session.created_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn claim_next(
    &self,
    queue_id: Option<&str>,
    started_at: DateTime<Utc>,
  ) -> Result<Option<SessionRecord>, QueueError> {
    let record = sqlx::query_as(
      r#"
            UPDATE sessions
            SET state = 'running', started_at = ?
            WHERE state = 'queued' AND seq = (
              SELECT seq FROM sessions
              WHERE state = 'queued' AND (? IS NULL OR queue_id = ?)
              ORDER BY priority DESC, seq ASC
              LIMIT 1
            )
            RETURNING seq, session_id, queue_id, state, priority, graph, cancel_requested,
                      results, error, created_at, started_at, completed_at
            "#,
    )
    .bind(started_at)
    .bind(queue_id)
    .bind(queue_id)
    .fetch_optional(&self.pool)
    .await?;

    Ok(record)
  }

  async fn get(&self, session_id: &str) -> Result<SessionRecord, QueueError> {
    let record: Option<SessionRecord> = sqlx::query_as(
      r#"
            SELECT seq, session_id, queue_id, state, priority, graph, cancel_requested,
                   results, error, created_at, started_at, completed_at
            FROM sessions
            WHERE session_id = ?
            "#,
    )
    .bind(session_id)
    .fetch_optional(&self.pool)
    .await?;

    record.ok_or_else(|| QueueError::not_found(session_id))
  }

  async fn list(&self, queue_id: &str) -> Result<Vec<SessionRecord>, QueueError> {
    let records = sqlx::query_as(
      r#"
            SELECT seq, session_id, queue_id, state, priority, graph, cancel_requested,
                   results, error, created_at, started_at, completed_at
            FROM sessions
            WHERE queue_id = ?
            ORDER BY seq ASC
            "#,
    )
    .bind(queue_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(records)
  }

  async fn cancel_queued(
    &self,
    session_id: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, QueueError> {
    let result = sqlx::query(
      r#"
            UPDATE sessions
            SET state = 'canceled', cancel_requested = 1, completed_at = ?
            WHERE session_id = ? AND state = 'queued'
            "#,
    )
    .bind(completed_at)
    .bind(session_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn request_cancel(&self, session_id: &str) -> Result<bool, QueueError> {
    let result = sqlx::query(
      r#"
            UPDATE sessions
            SET cancel_requested = 1
            WHERE session_id = ? AND state = 'running'
            "#,
    )
    .bind(session_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn cancel_all_queued(
    &self,
    queue_id: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<Vec<String>, QueueError> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
      r#"
            UPDATE sessions
            SET state = 'canceled', cancel_requested = 1, completed_at = ?
            WHERE queue_id = ? AND state = 'queued'
            RETURNING seq, session_id
            "#,
    )
    .bind(completed_at)
    .bind(queue_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(in_seq_order(rows))
  }

  async fn request_cancel_all(&self, queue_id: &str) -> Result<Vec<String>, QueueError> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
      r#"
            UPDATE sessions
            SET cancel_requested = 1
            WHERE queue_id = ? AND state = 'running'
            RETURNING seq, session_id
            "#,
    )
    .bind(queue_id)
    .fetch_all(&self.pool)
    .await?;

    Ok(in_seq_order(rows))
  }

  async fn finish(
    &self,
    session_id: &str,
    state: SessionState,
    results: &SessionResults,
    error: Option<&SessionError>,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, QueueError> {
    let result = sqlx::query(
      r#"
            UPDATE sessions
            SET state = ?, results = ?, error = ?, completed_at = ?
            WHERE session_id = ? AND state = 'running'
            "#,
    )
    .bind(state)
    .bind(Json(results))
    .bind(error.map(Json))
    .bind(completed_at)
    .bind(session_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected() == 1)
  }

  async fn interrupt_running(
    &self,
    error: &SessionError,
    completed_at: DateTime<Utc>,
  ) -> Result<Vec<String>, QueueError> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
      r#"
            UPDATE sessions
            SET state = 'errored', error = ?, completed_at = ?
            WHERE state = 'running'
            RETURNING seq, session_id
            "#,
    )
    .bind(Json(error))
    .bind(completed_at)
    .fetch_all(&self.pool)
    .await?;

    Ok(in_seq_order(rows))
  }

  async fn counts(&self, queue_id: &str) -> Result<QueueStatus, QueueError> {
    let rows: Vec<(SessionState, i64)> = sqlx::query_as(
      r#"
            SELECT state, COUNT(*)
            FROM sessions
            WHERE queue_id = ?
            GROUP BY state
            "#,
    )
    .bind(queue_id)
    .fetch_all(&self.pool)
    .await?;

    let mut status = QueueStatus {
      queue_id: queue_id.to_string(),
      ..Default::default()
    };
    for (state, count) in rows {
      status.add(state, count as u64);
    }
    Ok(status)
  }

  async fn prune(&self, queue_id: &str) -> Result<u64, QueueError> {
    let result = sqlx::query(
      r#"
            DELETE FROM sessions
            WHERE queue_id = ? AND state IN ('completed', 'errored', 'canceled')
            "#,
    )
    .bind(queue_id)
    .execute(&self.pool)
    .await?;

    Ok(result.rows_affected())
  }

  async fn clear(&self, queue_id: &str) -> Result<u64, QueueError> {
    let result = sqlx::query("DELETE FROM sessions WHERE queue_id = ?")
      .bind(queue_id)
      .execute(&self.pool)
      .await?;

    Ok(result.rows_affected())
  }
}

fn in_seq_order(mut rows: Vec<(i64, String)>) -> Vec<String> {
  rows.sort();
  rows.into_iter().map(|(_, id)| id).collect()
}
