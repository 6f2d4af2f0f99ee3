use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::error::QueueError;
use crate::store::SessionStore;
use crate::types::{
  NewSession, QueueStatus, SessionError, SessionRecord, SessionResults, SessionState,
};

#[derive(Default)]
struct Inner {
  sessions: HashMap<String, SessionRecord>,
  next_seq: i64,
}

/// Non-durable store for tests and `storage.mode = "memory"`.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn sorted(mut records: Vec<SessionRecord>) -> Vec<SessionRecord> {
  records.sort_by_key(|r| r.seq);
  records
}

#[async_trait]
impl SessionStore for MemoryStore {
  async fn insert(&self, session: &NewSession) -> Result<(), QueueError> {
    let mut inner = self.lock();
    inner.next_seq += 1;
    let record = SessionRecord {
      seq: inner.next_seq,
      session_id: session.session_id.clone(),
      queue_id: session.queue_id.clone(),
      state: SessionState::Queued,
      priority: session.priority,
      graph: Json(session.graph.clone()),
      cancel_requested: false,
      results: Json(SessionResults::new()),
      error: None,
      created_at: session.created_at,
      started_at: None,
      completed_at: None,
    };
    inner.sessions.insert(session.session_id.clone(), record);
    Ok(())
  }

  async fn claim_next(
    &self,
    queue_id: Option<&str>,
    started_at: DateTime<Utc>,
  ) -> Result<Option<SessionRecord>, QueueError> {
    let mut inner = self.lock();
    let next = inner
      .sessions
      .values()
      .filter(|r| r.state == SessionState::Queued)
      .filter(|r| queue_id.is_none_or(|q| r.queue_id == q))
      .min_by_key(|r| (std::cmp::Reverse(r.priority), r.seq))
      .map(|r| r.session_id.clone());

    Ok(next.and_then(|id| {
      inner.sessions.get_mut(&id).map(|record| {
        record.state = SessionState::Running;
        record.started_at = Some(started_at);
        record.clone()
      })
    }))
  }

  async fn get(&self, session_id: &str) -> Result<SessionRecord, QueueError> {
    self
      .lock()
      .sessions
      .get(session_id)
      .cloned()
      .ok_or_else(|| QueueError::not_found(session_id))
  }

  async fn list(&self, queue_id: &str) -> Result<Vec<SessionRecord>, QueueError> {
    let records = self
      .lock()
      .sessions
      .values()
      .filter(|r| r.queue_id == queue_id)
      .cloned()
      .collect();
    Ok(sorted(records))
  }

  async fn cancel_queued(
    &self,
    session_id: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, QueueError> {
    let mut inner = self.lock();
    match inner.sessions.get_mut(session_id) {
      Some(record) if record.state == SessionState::Queued => {
        record.state = SessionState::Canceled;
        record.cancel_requested = true;
        record.completed_at = Some(completed_at);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn request_cancel(&self, session_id: &str) -> Result<bool, QueueError> {
    let mut inner = self.lock();
    match inner.sessions.get_mut(session_id) {
      Some(record) if record.state == SessionState::Running => {
        record.cancel_requested = true;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn cancel_all_queued(
    &self,
    queue_id: &str,
    completed_at: DateTime<Utc>,
  ) -> Result<Vec<String>, QueueError> {
    let mut inner = self.lock();
    let mut canceled: Vec<(i64, String)> = Vec::new();
    for record in inner.sessions.values_mut() {
      if record.queue_id == queue_id && record.state == SessionState::Queued {
        record.state = SessionState::Canceled;
        record.cancel_requested = true;
        record.completed_at = Some(completed_at);
        canceled.push((record.seq, record.session_id.clone()));
      }
    }
    canceled.sort();
    Ok(canceled.into_iter().map(|(_, id)| id).collect())
  }

  async fn request_cancel_all(&self, queue_id: &str) -> Result<Vec<String>, QueueError> {
    let mut inner = self.lock();
    let mut requested: Vec<(i64, String)> = Vec::new();
    for record in inner.sessions.values_mut() {
      if record.queue_id == queue_id && record.state == SessionState::Running {
        record.cancel_requested = true;
        requested.push((record.seq, record.session_id.clone()));
      }
    }
    requested.sort();
    Ok(requested.into_iter().map(|(_, id)| id).collect())
  }

  async fn finish(
    &self,
    session_id: &str,
    state: SessionState,
    results: &SessionResults,
    error: Option<&SessionError>,
    completed_at: DateTime<Utc>,
  ) -> Result<bool, QueueError> {
    let mut inner = self.lock();
    match inner.sessions.get_mut(session_id) {
      Some(record) if record.state == SessionState::Running => {
        record.state = state;
        record.results = Json(results.clone());
        record.error = error.cloned().map(Json);
        record.completed_at = Some(completed_at);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn interrupt_running(
    &self,
    error: &SessionError,
    completed_at: DateTime<Utc>,
  ) -> Result<Vec<String>, QueueError> {
    let mut inner = self.lock();
    let mut interrupted: Vec<(i64, String)> = Vec::new();
    for record in inner.sessions.values_mut() {
      if record.state == SessionState::Running {
        record.state = SessionState::Errored;
        record.error = Some(Json(error.clone()));
        record.completed_at = Some(completed_at);
        interrupted.push((record.seq, record.session_id.clone()));
      }
    }
    interrupted.sort();
    Ok(interrupted.into_iter().map(|(_, id)| id).collect())
  }

  async fn counts(&self, queue_id: &str) -> Result<QueueStatus, QueueError> {
    let mut status = QueueStatus {
      queue_id: queue_id.to_string(),
      ..Default::default()
    };
    for record in self.lock().sessions.values() {
      if record.queue_id == queue_id {
        status.add(record.state, 1);
      }
    }
    Ok(status)
  }

  async fn prune(&self, queue_id: &str) -> Result<u64, QueueError> {
    let mut inner = self.lock();
    let before = inner.sessions.len();
    inner
      .sessions
      .retain(|_, r| r.queue_id != queue_id || !r.state.is_terminal());
    Ok((before - inner.sessions.len()) as u64)
  }

  async fn clear(&self, queue_id: &str) -> Result<u64, QueueError> {
    let mut inner = self.lock();
    let before = inner.sessions.len();
    inner.sessions.retain(|_, r| r.queue_id != queue_id);
    Ok((before - inner.sessions.len()) as u64)
  }
}
