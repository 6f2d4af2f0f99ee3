//! Bounded output cache with least-recently-used eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use cinder_invocation::Outputs;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fingerprint::Fingerprint;

/// Snapshot of cache occupancy and hit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
  pub size: usize,
  pub weight: usize,
  pub max_weight: usize,
  pub hits: u64,
  pub misses: u64,
  pub enabled: bool,
}

/// Storage for memoized invocation outputs.
///
/// Implementations own their eviction policy. Callers only ask for entries and
/// offer new ones.
pub trait InvocationCache: Send + Sync {
  /// Look up an entry, counting a hit or a miss.
  fn get(&self, key: &Fingerprint) -> Option<Arc<Outputs>>;

  /// Offer an entry. It may be dropped if it does not fit.
  fn put(&self, key: Fingerprint, outputs: Outputs, weight: usize);

  /// Remove one entry. Returns whether it was present.
  fn delete(&self, key: &Fingerprint) -> bool;

  /// Drop every entry and reset the hit counters.
  fn clear(&self);

  fn enable(&self);

  fn disable(&self);

  fn status(&self) -> CacheStatus;
}

struct Entry {
  outputs: Arc<Outputs>,
  weight: usize,
  last_access: AtomicU64,
}

/// In-process cache bounded by total entry weight.
///
/// A `max_weight` of 0 turns the cache off entirely: every lookup misses and
/// nothing is stored.
pub struct MemoryCache {
  entries: DashMap<Fingerprint, Entry>,
  max_weight: usize,
  weight: AtomicUsize,
  clock: AtomicU64,
  hits: AtomicU64,
  misses: AtomicU64,
  enabled: AtomicBool,
}

impl MemoryCache {
  pub fn new(max_weight: usize) -> Self {
    Self {
      entries: DashMap::new(),
      max_weight,
      weight: AtomicUsize::new(0),
      clock: AtomicU64::new(0),
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      enabled: AtomicBool::new(true),
    }
  }

  fn active(&self) -> bool {
    self.max_weight > 0 && self.enabled.load(Ordering::Acquire)
  }

  fn tick(&self) -> u64 {
    self.clock.fetch_add(1, Ordering::Relaxed)
  }

  /// Key with the lowest access tick, skipping `keep`.
  fn least_recent(&self, keep: &Fingerprint) -> Option<Fingerprint> {
    self
      .entries
      .iter()
      .filter(|entry| entry.key() != keep)
      .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
      .map(|entry| entry.key().clone())
  }

  fn remove(&self, key: &Fingerprint) -> bool {
    match self.entries.remove(key) {
      Some((_, entry)) => {
        self.weight.fetch_sub(entry.weight, Ordering::AcqRel);
        true
      }
      None => false,
    }
  }

  fn evict_over_capacity(&self, keep: &Fingerprint) {
    while self.weight.load(Ordering::Acquire) > self.max_weight {
      let Some(victim) = self.least_recent(keep) else {
        break;
      };
      if self.remove(&victim) {
        debug!(fingerprint = %victim, "cache_evicted");
      }
    }
  }
}

impl InvocationCache for MemoryCache {
  fn get(&self, key: &Fingerprint) -> Option<Arc<Outputs>> {
    if !self.active() {
      return None;
    }

    let found = self.entries.get(key).map(|entry| {
      entry.last_access.store(self.tick(), Ordering::Relaxed);
      entry.outputs.clone()
    });

    match &found {
      Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
      None => self.misses.fetch_add(1, Ordering::Relaxed),
    };
    found
  }

  fn put(&self, key: Fingerprint, outputs: Outputs, weight: usize) {
    if !self.active() || weight > self.max_weight {
      return;
    }

    let entry = Entry {
      outputs: Arc::new(outputs),
      weight,
      last_access: AtomicU64::new(self.tick()),
    };

    if let Some(previous) = self.entries.insert(key.clone(), entry) {
      self.weight.fetch_sub(previous.weight, Ordering::AcqRel);
    }
    self.weight.fetch_add(weight, Ordering::AcqRel);

    self.evict_over_capacity(&key);
  }

  fn delete(&self, key: &Fingerprint) -> bool {
    self.remove(key)
  }

  fn clear(&self) {
    let keys: Vec<Fingerprint> = self.entries.iter().map(|e| e.key().clone()).collect();
    for key in keys {
      self.remove(&key);
    }
    self.hits.store(0, Ordering::Relaxed);
    self.misses.store(0, Ordering::Relaxed);
  }

  fn enable(&self) {
    self.enabled.store(true, Ordering::Release);
  }

  fn disable(&self) {
    self.enabled.store(false, Ordering::Release);
  }

  fn status(&self) -> CacheStatus {
    CacheStatus {
      size: self.entries.len(),
      weight: self.weight.load(Ordering::Acquire),
      max_weight: self.max_weight,
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      enabled: self.enabled.load(Ordering::Acquire),
    }
  }
}
