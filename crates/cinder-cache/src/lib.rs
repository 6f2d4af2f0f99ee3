//! Invocation output caching.
//!
//! Outputs are memoized under a [`Fingerprint`] derived from the invocation
//! kind and its resolved inputs. Identical work submitted by different sessions
//! is computed once and served from the cache afterwards.
//!
//! The cache only stores and evicts. Making sure two concurrent requests for the
//! same fingerprint don't both compute is the invoker's job.

mod cache;
mod fingerprint;

pub use cache::{CacheStatus, InvocationCache, MemoryCache};
pub use fingerprint::{Fingerprint, FingerprintError};
