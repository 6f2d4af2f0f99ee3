use crate::types::SessionState;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// The session does not exist (or was pruned).
  #[error("session not found: {session_id}")]
  NotFound { session_id: String },

  /// The session is not in a state that allows the requested change.
  #[error("session {session_id} cannot move from {from} to {to}")]
  InvalidTransition {
    session_id: String,
    from: SessionState,
    to: SessionState,
  },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),
}

impl QueueError {
  pub(crate) fn not_found(session_id: &str) -> Self {
    QueueError::NotFound {
      session_id: session_id.to_string(),
    }
  }
}
