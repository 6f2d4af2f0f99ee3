use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{Event, EventPayload};

/// Receives lifecycle events.
///
/// Producers call `notify` inline, so implementations must not block.
pub trait EventSink: Send + Sync {
  fn notify(&self, event: Event);
}

/// Discards every event.
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
  fn notify(&self, _event: Event) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
  sender: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
  pub fn new(sender: mpsc::UnboundedSender<Event>) -> Self {
    Self { sender }
  }

  /// Create a sink together with the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self { sender }, receiver)
  }
}

impl EventSink for ChannelSink {
  fn notify(&self, event: Event) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
  fn notify(&self, event: Event) {
    let name = event.name();
    let session_id = event.session_id().unwrap_or("-");
    match &event.payload {
      EventPayload::InvocationError {
        invocation_id,
        error_type,
        message,
        ..
      } => {
        warn!(session_id, invocation_id, error_type, message, "{name}");
      }
      EventPayload::SessionErrored {
        error_type,
        invocation_id,
        message,
        ..
      } => {
        warn!(session_id, ?invocation_id, error_type, message, "{name}");
      }
      EventPayload::InvocationStarted { invocation_id, .. }
      | EventPayload::InvocationCompleted { invocation_id, .. } => {
        debug!(session_id, invocation_id, "{name}");
      }
      _ => debug!(session_id, queue_id = event.queue_id(), "{name}"),
    }
  }
}
