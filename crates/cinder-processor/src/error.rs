use cinder_queue::QueueError;

/// Errors from [`SessionProcessor`](crate::SessionProcessor).
///
/// Failures inside a session are not errors here: they end the session as
/// `errored` and are reported through the queue and events.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
  /// The queue refused or lost the session's outcome.
  #[error("queue error: {0}")]
  Queue(#[from] QueueError),
}
