//! Timing and hit counters for invocation execution.
//!
//! Counters are tracked twice: per session, and process-wide per kind. A
//! session's counters live until it is finished; the per-kind counters grow
//! until they are explicitly reset.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StatsError;

/// Outcome of one invocation, as reported by the invoker.
#[derive(Debug, Clone, Copy)]
pub struct InvocationSample {
  pub duration: Duration,
  pub cached: bool,
  pub failed: bool,
}

impl InvocationSample {
  pub fn executed(duration: Duration) -> Self {
    Self {
      duration,
      cached: false,
      failed: false,
    }
  }

  pub fn cache_hit() -> Self {
    Self {
      duration: Duration::ZERO,
      cached: true,
      failed: false,
    }
  }

  pub fn failed(duration: Duration) -> Self {
    Self {
      duration,
      cached: false,
      failed: true,
    }
  }
}

/// Counters for a single invocation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStats {
  /// Every invocation, cached or not.
  pub calls: u64,
  pub cache_hits: u64,
  pub failures: u64,
  /// Time spent inside invocation bodies.
  pub total_time: Duration,
}

impl KindStats {
  fn record(&mut self, sample: InvocationSample) {
    self.calls += 1;
    if sample.cached {
      self.cache_hits += 1;
    }
    if sample.failed {
      self.failures += 1;
    }
    self.total_time += sample.duration;
  }

  /// Calls that actually ran the body.
  pub fn executions(&self) -> u64 {
    self.calls - self.cache_hits
  }
}

/// Statistics for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
  pub session_id: String,
  pub queue_id: String,
  pub started_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
  pub kinds: BTreeMap<String, KindStats>,
}

impl SessionStats {
  /// Wall time from start to completion, or to now while still running.
  pub fn wall_time(&self) -> Duration {
    let end = self.completed_at.unwrap_or_else(Utc::now);
    (end - self.started_at).to_std().unwrap_or_default()
  }

  pub fn totals(&self) -> KindStats {
    self.kinds.values().fold(KindStats::default(), |mut acc, k| {
      acc.calls += k.calls;
      acc.cache_hits += k.cache_hits;
      acc.failures += k.failures;
      acc.total_time += k.total_time;
      acc
    })
  }

  /// Human readable table, one row per kind.
  pub fn summary(&self) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "session {} (queue {})", self.session_id, self.queue_id);
    write_table(&mut out, &self.kinds);
    let _ = write!(out, "wall time: {:.3}s", self.wall_time().as_secs_f64());
    out
  }
}

fn write_table(out: &mut String, kinds: &BTreeMap<String, KindStats>) {
  let _ = writeln!(
    out,
    "{:<24} {:>6} {:>6} {:>6} {:>10}",
    "kind", "calls", "hits", "failed", "time (s)"
  );
  for (kind, stats) in kinds {
    let _ = writeln!(
      out,
      "{:<24} {:>6} {:>6} {:>6} {:>10.3}",
      kind,
      stats.calls,
      stats.cache_hits,
      stats.failures,
      stats.total_time.as_secs_f64()
    );
  }
}

/// Collects invocation statistics across all sessions.
///
/// Shared by `Arc` between the invoker and the processor.
#[derive(Debug, Default)]
pub struct StatsCollector {
  sessions: Mutex<HashMap<String, SessionStats>>,
  kinds: Mutex<BTreeMap<String, KindStats>>,
}

impl StatsCollector {
  pub fn new() -> Self {
    Self::default()
  }

  /// Begin tracking a session. Restarting a known session keeps its counters.
  pub fn start_session(&self, session_id: &str, queue_id: &str) {
    lock(&self.sessions)
      .entry(session_id.to_string())
      .or_insert_with(|| SessionStats {
        session_id: session_id.to_string(),
        queue_id: queue_id.to_string(),
        started_at: Utc::now(),
        completed_at: None,
        kinds: BTreeMap::new(),
      });
  }

  /// Record one invocation.
  ///
  /// The process-wide counters are always updated. An error means the
  /// session was never started, so only its own counters are missing.
  pub fn record(
    &self,
    session_id: &str,
    kind: &str,
    sample: InvocationSample,
  ) -> Result<(), StatsError> {
    lock(&self.kinds)
      .entry(kind.to_string())
      .or_default()
      .record(sample);

    let mut sessions = lock(&self.sessions);
    let session = sessions
      .get_mut(session_id)
      .ok_or_else(|| StatsError::UnknownSession(session_id.to_string()))?;
    session
      .kinds
      .entry(kind.to_string())
      .or_default()
      .record(sample);
    Ok(())
  }

  /// Stamp the session's completion time.
  pub fn complete_session(&self, session_id: &str) -> Result<(), StatsError> {
    let mut sessions = lock(&self.sessions);
    let session = sessions
      .get_mut(session_id)
      .ok_or_else(|| StatsError::UnknownSession(session_id.to_string()))?;
    session.completed_at.get_or_insert_with(Utc::now);
    Ok(())
  }

  pub fn session(&self, session_id: &str) -> Result<SessionStats, StatsError> {
    lock(&self.sessions)
      .get(session_id)
      .cloned()
      .ok_or_else(|| StatsError::UnknownSession(session_id.to_string()))
  }

  /// Process-wide counters for one kind. Zero if it never ran.
  pub fn kind(&self, kind: &str) -> KindStats {
    lock(&self.kinds).get(kind).copied().unwrap_or_default()
  }

  pub fn kinds(&self) -> BTreeMap<String, KindStats> {
    lock(&self.kinds).clone()
  }

  /// Emit the session summary through tracing.
  pub fn log_session(&self, session_id: &str) -> Result<(), StatsError> {
    let stats = self.session(session_id)?;
    let totals = stats.totals();
    info!(
      session_id,
      calls = totals.calls,
      cache_hits = totals.cache_hits,
      failures = totals.failures,
      wall_time_ms = stats.wall_time().as_millis() as u64,
      "session_stats"
    );
    Ok(())
  }

  /// Complete a session, log its summary and stop tracking it.
  ///
  /// Returns the final counters. The per-kind counters keep them.
  pub fn finish_session(&self, session_id: &str) -> Result<SessionStats, StatsError> {
    self.complete_session(session_id)?;
    self.log_session(session_id)?;
    lock(&self.sessions)
      .remove(session_id)
      .ok_or_else(|| StatsError::UnknownSession(session_id.to_string()))
  }

  /// Number of sessions currently tracked.
  pub fn tracked_sessions(&self) -> usize {
    lock(&self.sessions).len()
  }

  /// Process-wide table, one row per kind.
  pub fn summary(&self) -> String {
    let mut out = String::new();
    write_table(&mut out, &self.kinds());
    out
  }

  /// Forget one session.
  pub fn reset_session(&self, session_id: &str) -> Result<(), StatsError> {
    lock(&self.sessions)
      .remove(session_id)
      .map(|_| ())
      .ok_or_else(|| StatsError::UnknownSession(session_id.to_string()))
  }

  /// Forget everything, including the process-wide counters.
  pub fn reset(&self) {
    lock(&self.sessions).clear();
    lock(&self.kinds).clear();
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_records_per_session_and_per_kind() {
    let stats = StatsCollector::new();
    stats.start_session("s1", "default");
    stats.start_session("s2", "default");

    stats
      .record("s1", "add", InvocationSample::executed(Duration::from_millis(5)))
      .unwrap();
    stats.record("s2", "add", InvocationSample::cache_hit()).unwrap();
    stats
      .record("s2", "divide", InvocationSample::failed(Duration::from_millis(1)))
      .unwrap();

    let add = stats.kind("add");
    assert_eq!(add.calls, 2);
    assert_eq!(add.cache_hits, 1);
    assert_eq!(add.executions(), 1);
    assert_eq!(add.total_time, Duration::from_millis(5));
    assert_eq!(stats.kind("divide").failures, 1);

    let s2 = stats.session("s2").unwrap();
    assert_eq!(s2.totals().calls, 2);
    assert_eq!(s2.kinds["add"].cache_hits, 1);
  }

  #[test]
  fn test_unknown_session_still_counts_globally() {
    let stats = StatsCollector::new();
    let err = stats
      .record("missing", "add", InvocationSample::cache_hit())
      .unwrap_err();

    assert_eq!(err, StatsError::UnknownSession("missing".to_string()));
    assert_eq!(stats.kind("add").calls, 1);
  }

  #[test]
  fn test_totals_never_decrease() {
    let stats = StatsCollector::new();
    stats.start_session("s", "q");

    let mut last = Duration::ZERO;
    for ms in [3, 0, 7] {
      stats
        .record("s", "add", InvocationSample::executed(Duration::from_millis(ms)))
        .unwrap();
      let total = stats.kind("add").total_time;
      assert!(total >= last);
      last = total;
    }
    assert_eq!(stats.kind("add").calls, 3);
  }

  #[test]
  fn test_complete_and_reset() {
    let stats = StatsCollector::new();
    stats.start_session("s", "q");
    stats.record("s", "add", InvocationSample::cache_hit()).unwrap();
    stats.complete_session("s").unwrap();

    let session = stats.session("s").unwrap();
    assert!(session.completed_at.is_some());
    assert!(session.summary().contains("add"));

    stats.reset_session("s").unwrap();
    assert!(stats.session("s").is_err());
    assert_eq!(stats.kind("add").calls, 1);

    stats.reset();
    assert_eq!(stats.kind("add").calls, 0);
    assert!(stats.kinds().is_empty());
  }

  #[test]
  fn test_finish_session_stops_tracking() {
    let stats = StatsCollector::new();
    for n in 0..3 {
      let id = format!("s{}", n);
      stats.start_session(&id, "q");
      stats
        .record(&id, "add", InvocationSample::executed(Duration::from_millis(1)))
        .unwrap();

      let finished = stats.finish_session(&id).unwrap();
      assert!(finished.completed_at.is_some());
      assert_eq!(finished.totals().calls, 1);
      assert_eq!(stats.tracked_sessions(), 0);
    }

    assert_eq!(stats.kind("add").calls, 3);
    assert!(stats.summary().contains("add"));
    assert_eq!(
      stats.finish_session("s0").unwrap_err(),
      StatsError::UnknownSession("s0".to_string())
    );
  }

  #[test]
  fn test_session_stats_serialize() {
    let stats = StatsCollector::new();
    stats.start_session("s", "q");
    let json = serde_json::to_value(stats.session("s").unwrap()).unwrap();
    assert_eq!(json["queue_id"], "q");
  }
}
