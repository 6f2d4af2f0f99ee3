use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A timestamped lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub timestamp: DateTime<Utc>,
  #[serde(flatten)]
  pub payload: EventPayload,
}

impl Event {
  /// Stamp a payload with the current time.
  pub fn new(payload: EventPayload) -> Self {
    Self {
      timestamp: Utc::now(),
      payload,
    }
  }

  /// The session this event belongs to, if any.
  pub fn session_id(&self) -> Option<&str> {
    match &self.payload {
      EventPayload::SessionQueued { session_id, .. }
      | EventPayload::SessionStarted { session_id, .. }
      | EventPayload::InvocationStarted { session_id, .. }
      | EventPayload::InvocationCompleted { session_id, .. }
      | EventPayload::InvocationError { session_id, .. }
      | EventPayload::SessionCompleted { session_id, .. }
      | EventPayload::SessionErrored { session_id, .. }
      | EventPayload::SessionCanceled { session_id, .. } => Some(session_id),
      EventPayload::QueueCleared { .. } => None,
    }
  }

  pub fn queue_id(&self) -> &str {
    match &self.payload {
      EventPayload::SessionQueued { queue_id, .. }
      | EventPayload::SessionStarted { queue_id, .. }
      | EventPayload::InvocationStarted { queue_id, .. }
      | EventPayload::InvocationCompleted { queue_id, .. }
      | EventPayload::InvocationError { queue_id, .. }
      | EventPayload::SessionCompleted { queue_id, .. }
      | EventPayload::SessionErrored { queue_id, .. }
      | EventPayload::SessionCanceled { queue_id, .. }
      | EventPayload::QueueCleared { queue_id } => queue_id,
    }
  }

  /// Short snake_case name of the payload variant.
  pub fn name(&self) -> &'static str {
    match &self.payload {
      EventPayload::SessionQueued { .. } => "session_queued",
      EventPayload::SessionStarted { .. } => "session_started",
      EventPayload::InvocationStarted { .. } => "invocation_started",
      EventPayload::InvocationCompleted { .. } => "invocation_completed",
      EventPayload::InvocationError { .. } => "invocation_error",
      EventPayload::SessionCompleted { .. } => "session_completed",
      EventPayload::SessionErrored { .. } => "session_errored",
      EventPayload::SessionCanceled { .. } => "session_canceled",
      EventPayload::QueueCleared { .. } => "queue_cleared",
    }
  }

  /// Whether this event ends a session's lifecycle.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self.payload,
      EventPayload::SessionCompleted { .. }
        | EventPayload::SessionErrored { .. }
        | EventPayload::SessionCanceled { .. }
    )
  }
}

/// What happened.
///
/// `invocation_id` is the instance id: the node id, suffixed with the
/// iteration index path for nodes inside an iterate scope (`double[2]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
  /// A session was accepted into a queue.
  SessionQueued {
    queue_id: String,
    session_id: String,
    priority: i32,
  },

  /// A worker picked the session up.
  SessionStarted {
    queue_id: String,
    session_id: String,
  },

  InvocationStarted {
    queue_id: String,
    session_id: String,
    invocation_id: String,
    node_id: String,
    kind: String,
  },

  /// An invocation produced outputs, either by running or from the cache.
  InvocationCompleted {
    queue_id: String,
    session_id: String,
    invocation_id: String,
    node_id: String,
    kind: String,
    cached: bool,
    outputs: serde_json::Value,
  },

  InvocationError {
    queue_id: String,
    session_id: String,
    invocation_id: String,
    node_id: String,
    kind: String,
    error_type: String,
    message: String,
  },

  SessionCompleted {
    queue_id: String,
    session_id: String,
  },

  /// The session stopped on an error. `invocation_id` is absent when the
  /// graph never got as far as running a node.
  SessionErrored {
    queue_id: String,
    session_id: String,
    error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    message: String,
  },

  SessionCanceled {
    queue_id: String,
    session_id: String,
  },

  /// Every session of a queue was removed.
  QueueCleared { queue_id: String },
}
