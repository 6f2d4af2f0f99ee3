use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use cinder_config::GraphDef;
use cinder_invocation::Outputs;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;

/// Outputs of every finished invocation instance, keyed by instance id.
pub type SessionResults = BTreeMap<String, Outputs>;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SessionState {
  Queued,
  Running,
  Completed,
  Errored,
  Canceled,
}

impl SessionState {
  /// Completed, errored and canceled sessions never change again.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      SessionState::Completed | SessionState::Errored | SessionState::Canceled
    )
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SessionState::Queued => "queued",
      SessionState::Running => "running",
      SessionState::Completed => "completed",
      SessionState::Errored => "errored",
      SessionState::Canceled => "canceled",
    }
  }
}

impl fmt::Display for SessionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Why a session ended in `errored`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
  /// `ResolutionError`, `InvocationError`, `TimedOut`, `Interrupted` or `QueueError`.
  pub error_type: String,
  /// The failing invocation instance, when one was running.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub invocation_id: Option<String>,
  pub message: String,
}

impl SessionError {
  pub fn new(
    error_type: impl Into<String>,
    invocation_id: Option<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      error_type: error_type.into(),
      invocation_id,
      message: message.into(),
    }
  }
}

/// A session as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
  /// Enqueue order, assigned by the store.
  pub seq: i64,
  pub session_id: String,
  pub queue_id: String,
  pub state: SessionState,
  pub priority: i32,
  pub graph: Json<GraphDef>,
  pub cancel_requested: bool,
  pub results: Json<SessionResults>,
  pub error: Option<Json<SessionError>>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
  pub fn status(&self) -> SessionStatus {
    SessionStatus {
      session_id: self.session_id.clone(),
      queue_id: self.queue_id.clone(),
      state: self.state,
      priority: self.priority,
      cancel_requested: self.cancel_requested,
      error: self.error.as_ref().map(|e| e.0.clone()),
      created_at: self.created_at,
      started_at: self.started_at,
      completed_at: self.completed_at,
    }
  }
}

/// What a store needs to create a session.
#[derive(Debug, Clone)]
pub struct NewSession {
  pub session_id: String,
  pub queue_id: String,
  pub priority: i32,
  pub graph: GraphDef,
  pub created_at: DateTime<Utc>,
}

/// Session state without the graph and results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
  pub session_id: String,
  pub queue_id: String,
  pub state: SessionState,
  pub priority: i32,
  pub cancel_requested: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<SessionError>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

/// A dequeued session, handed to the processor.
#[derive(Debug, Clone)]
pub struct Session {
  pub session_id: String,
  pub queue_id: String,
  pub priority: i32,
  pub graph: GraphDef,
  /// Fired when the session is canceled while running.
  pub cancel: CancellationToken,
}

/// How the processor finished a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
  Completed { results: SessionResults },
  /// Results hold every instance that finished before the failure.
  Errored {
    error: SessionError,
    results: SessionResults,
  },
  Canceled { results: SessionResults },
}

impl SessionOutcome {
  pub fn state(&self) -> SessionState {
    match self {
      SessionOutcome::Completed { .. } => SessionState::Completed,
      SessionOutcome::Errored { .. } => SessionState::Errored,
      SessionOutcome::Canceled { .. } => SessionState::Canceled,
    }
  }

  pub fn results(&self) -> &SessionResults {
    match self {
      SessionOutcome::Completed { results }
      | SessionOutcome::Errored { results, .. }
      | SessionOutcome::Canceled { results } => results,
    }
  }

  pub fn error(&self) -> Option<&SessionError> {
    match self {
      SessionOutcome::Errored { error, .. } => Some(error),
      _ => None,
    }
  }
}

/// Session counts per state for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
  pub queue_id: String,
  pub queued: u64,
  pub running: u64,
  pub completed: u64,
  pub errored: u64,
  pub canceled: u64,
}

impl QueueStatus {
  pub fn total(&self) -> u64 {
    self.queued + self.running + self.completed + self.errored + self.canceled
  }

  pub(crate) fn add(&mut self, state: SessionState, count: u64) {
    match state {
      SessionState::Queued => self.queued += count,
      SessionState::Running => self.running += count,
      SessionState::Completed => self.completed += count,
      SessionState::Errored => self.errored += count,
      SessionState::Canceled => self.canceled += count,
    }
  }
}

/// Result of canceling a whole queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSummary {
  /// Queued sessions moved straight to `canceled`.
  pub canceled: Vec<String>,
  /// Running sessions asked to stop.
  pub requested: Vec<String>,
}
