//! Per-fingerprint execution locks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use cinder_cache::Fingerprint;
use tokio::sync::OwnedMutexGuard;

type Slots = HashMap<Fingerprint, Weak<tokio::sync::Mutex<()>>>;

/// Serializes work on the same fingerprint.
///
/// The table only holds weak references. A lock lives as long as someone holds
/// or waits for it, and its entry is removed when the last guard is dropped.
#[derive(Debug, Default)]
pub struct LockTable {
  slots: Mutex<Slots>,
}

type Acquiring = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

/// A pending acquire. Dropping it before it completes still cleans up the
/// entry once nobody else holds the lock.
struct Waiter<'a> {
  acquiring: Acquiring,
  table: &'a LockTable,
  key: Fingerprint,
}

/// Exclusive access to one fingerprint. Released on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
  guard: Option<OwnedMutexGuard<()>>,
  table: &'a LockTable,
  key: Fingerprint,
}

impl LockTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`.
  pub async fn acquire(&self, key: &Fingerprint) -> LockGuard<'_> {
    let mutex = {
      let mut slots = self.slots();
      match slots.get(key).and_then(Weak::upgrade) {
        Some(mutex) => mutex,
        None => {
          let mutex = Arc::new(tokio::sync::Mutex::new(()));
          slots.insert(key.clone(), Arc::downgrade(&mutex));
          mutex
        }
      }
    };

    let mut waiter = Waiter {
      acquiring: Box::pin(mutex.lock_owned()),
      table: self,
      key: key.clone(),
    };
    let guard = waiter.acquiring.as_mut().await;

    LockGuard {
      guard: Some(guard),
      table: self,
      key: key.clone(),
    }
  }

  /// Number of fingerprints with a live lock entry.
  pub fn len(&self) -> usize {
    self.slots().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn slots(&self) -> MutexGuard<'_, Slots> {
    self.slots.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Remove `key` if no guard or waiter references its mutex anymore.
  fn release(&self, key: &Fingerprint) {
    let mut slots = self.slots();
    if slots
      .get(key)
      .is_some_and(|weak| weak.strong_count() == 0)
    {
      slots.remove(key);
    }
  }
}

impl Drop for Waiter<'_> {
  fn drop(&mut self) {
    // Drop the pending acquire, and the reference it holds, before checking.
    drop(std::mem::replace(
      &mut self.acquiring,
      Box::pin(std::future::pending()),
    ));
    self.table.release(&self.key);
  }
}

impl Drop for LockGuard<'_> {
  fn drop(&mut self) {
    // Release the mutex first so its strong count reflects remaining waiters.
    self.guard.take();
    self.table.release(&self.key);
  }
}
