//! Cinder Queue
//!
//! Sessions wait here between submission and processing. The queue owns every
//! session's lifecycle record; the processor only reports back through
//! [`SessionQueue::finish`].
//!
//! Storage is pluggable through the [`SessionStore`] trait:
//! - [`MemoryStore`] keeps sessions in process memory
//! - [`SqliteStore`] persists them with sqlx so queued work survives restarts

mod error;
mod memory;
mod queue;
mod sqlite;
mod store;
mod types;

pub use error::QueueError;
pub use memory::MemoryStore;
pub use queue::{DEFAULT_QUEUE_ID, SessionQueue};
pub use sqlite::SqliteStore;
pub use store::SessionStore;
pub use types::{
  CancelSummary, NewSession, QueueStatus, Session, SessionError, SessionOutcome, SessionRecord,
  SessionResults, SessionState, SessionStatus,
};
