//! Cinder Processor
//!
//! Pulls sessions off the [`SessionQueue`](cinder_queue::SessionQueue),
//! resolves their graphs and runs the resulting plans through the
//! [`Invoker`](cinder_invoker::Invoker).
//!
//! Each worker loop runs one session at a time. Within a session, steps run
//! in plan order, or in ready waves of up to `node_concurrency` steps when
//! the configuration allows it.

mod error;
mod processor;
mod run;

pub use error::ProcessorError;
pub use processor::{ProcessorConfig, SessionProcessor};
