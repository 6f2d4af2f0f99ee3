//! Executes one invocation at a time on behalf of the session processor.

mod error;
mod invoker;
mod lock;

pub use error::InvokeError;
pub use invoker::{InvokeRequest, Invoker, SessionContext};
pub use lock::{LockGuard, LockTable};
