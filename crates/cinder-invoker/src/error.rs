//! Invoker error types.

/// Errors returned by [`Invoker::invoke`](crate::Invoker::invoke).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InvokeError {
  /// The invocation body reported a failure.
  #[error("invocation '{invocation_id}' failed: {error_type}: {message}")]
  Failed {
    invocation_id: String,
    error_type: String,
    message: String,
  },

  /// The body did not finish within its time limit.
  #[error("invocation '{invocation_id}' timed out after {timeout_ms}ms")]
  TimedOut {
    invocation_id: String,
    timeout_ms: u64,
  },

  /// The owning session was canceled.
  #[error("invocation '{invocation_id}' canceled")]
  Canceled { invocation_id: String },

  /// No kind of this name is registered.
  #[error("invocation '{invocation_id}' has unknown kind '{kind}'")]
  UnknownKind { invocation_id: String, kind: String },
}

impl InvokeError {
  pub fn invocation_id(&self) -> &str {
    match self {
      InvokeError::Failed { invocation_id, .. }
      | InvokeError::TimedOut { invocation_id, .. }
      | InvokeError::Canceled { invocation_id }
      | InvokeError::UnknownKind { invocation_id, .. } => invocation_id,
    }
  }

  /// Error type reported in events and persisted with the session.
  pub fn error_type(&self) -> &str {
    match self {
      InvokeError::Failed { error_type, .. } => error_type,
      InvokeError::TimedOut { .. } => "TimedOut",
      InvokeError::Canceled { .. } => "Canceled",
      InvokeError::UnknownKind { .. } => "UnknownKind",
    }
  }

  pub fn is_canceled(&self) -> bool {
    matches!(self, InvokeError::Canceled { .. })
  }
}
