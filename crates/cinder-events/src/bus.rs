use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::event::Event;
use crate::sink::EventSink;

/// Fans events out to every subscriber.
///
/// Each subscriber owns an unbounded channel, so a slow consumer never holds
/// up the producer or the other subscribers. Senders whose receiver is gone
/// are dropped on the next `notify`.
#[derive(Debug, Default)]
pub struct EventBus {
  subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Receive every event published from now on.
  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
    let (sender, receiver) = mpsc::unbounded_channel();
    self.lock().push(sender);
    receiver
  }

  /// Drain a dedicated channel into `sink` on a spawned task.
  ///
  /// Must be called from within a tokio runtime. The task ends when the bus
  /// is dropped.
  pub fn register(&self, sink: Arc<dyn EventSink>) -> tokio::task::JoinHandle<()> {
    let mut receiver = self.subscribe();
    tokio::spawn(async move {
      while let Some(event) = receiver.recv().await {
        sink.notify(event);
      }
    })
  }

  pub fn subscriber_count(&self) -> usize {
    self.lock().len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Event>>> {
    self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl EventSink for EventBus {
  fn notify(&self, event: Event) {
    let mut subscribers = self.lock();
    subscribers.retain(|sender| sender.send(event.clone()).is_ok());
  }
}
