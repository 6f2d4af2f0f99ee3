//! Lifecycle events emitted while sessions are queued and processed.
//!
//! Producers hold an `Arc<dyn EventSink>` and call `notify` for every
//! transition. What happens next is up to the sink: drop the event, forward it
//! to a channel, fan it out to subscribers, or log it.

mod bus;
mod event;
mod sink;

pub use bus::EventBus;
pub use event::{Event, EventPayload};
pub use sink::{ChannelSink, EventSink, NoopSink, TracingSink};
