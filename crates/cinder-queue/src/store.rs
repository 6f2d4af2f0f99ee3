use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::types::{
  NewSession, QueueStatus, SessionError, SessionRecord, SessionResults, SessionState,
};

/// Storage for session records.
///
/// Every state change is a single conditional operation, so concurrent
/// callers can never both win the same transition.
#[async_trait]
pub trait SessionStore: Send + Sync {
  /// Store a new queued session.
  async fn insert(&self, session: &NewSession) -> Result<(), QueueError>;

  /// Atomically move the next queued session to `running` and return it.
  ///
  /// Highest priority first, then enqueue order. `queue_id` of `None` takes
  /// from any queue.
  async fn claim_next(
    &self,
    queue_id: Option<&str>,
    started_at: DateTime<Utc>,
  ) -> Result<Option<SessionRecord>, QueueError>;

  async fn get(&self, session_id: &str) -> Result<SessionRecord, QueueError>;

  /// Every session of a queue in enqueue order.
  async fn list(&self, queue_id: &str) -> Result<Vec<SessionRecord>, QueueError>;

  /// `queued` -> `canceled`. Returns false if the session was not queued.
  async fn cancel_queued(
    &self,
    session_id: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, QueueError>;

  /// Flag a running session. Returns false if the session was not running.
  async fn request_cancel(&self, session_id: &str) -> Result<bool, QueueError>;

  /// Cancel every queued session of a queue, returning their ids.
  async fn cancel_all_queued(
    &self,
    queue_id: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<Vec<String>, QueueError>;

  /// Flag every running session of a queue, returning their ids.
  async fn request_cancel_all(&self, queue_id: &str) -> Result<Vec<String>, QueueError>;

  /// `running` -> terminal `state`. Returns false if the session was not running.
  async fn finish(
    &self,
    session_id: &str,
    state: SessionState,
    results: &SessionResults,
    error: Option<&SessionError>,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, QueueError>;

  /// Move every running session to `errored` with `error`, returning their ids.
  async fn interrupt_running(
    &self,
    error: &SessionError,
    completed_at: DateTime<Utc>,
  ) -> Result<Vec<String>, QueueError>;

  async fn counts(&self, queue_id: &str) -> Result<QueueStatus, QueueError>;

  /// Delete terminal sessions of a queue.
  async fn prune(&self, queue_id: &str) -> Result<u64, QueueError>;

  /// Delete every session of a queue.
  async fn clear(&self, queue_id: &str) -> Result<u64, QueueError>;
}
