//! The session queue: submission, ordering, cancellation and completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use cinder_config::GraphDef;
use cinder_events::{Event, EventPayload, EventSink};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::QueueError;
use crate::memory::MemoryStore;
use crate::store::SessionStore;
use crate::types::{
  CancelSummary, NewSession, QueueStatus, Session, SessionError, SessionOutcome, SessionRecord,
  SessionState, SessionStatus,
};

/// Queue id used when a client doesn't name one.
pub const DEFAULT_QUEUE_ID: &str = "default";

/// Ordered, cancellable queue of sessions over a [`SessionStore`].
///
/// Within a queue id, higher priority dequeues first and equal priorities in
/// submission order. Running sessions get a [`CancellationToken`] that
/// [`cancel`](Self::cancel) fires; the session only becomes `canceled` once
/// the processor calls [`finish`](Self::finish).
pub struct SessionQueue {
  store: Arc<dyn SessionStore>,
  events: Arc<dyn EventSink>,
  ready: Notify,
  /// Cancellation tokens of sessions running in this process.
  tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionQueue {
  pub fn new(store: Arc<dyn SessionStore>, events: Arc<dyn EventSink>) -> Self {
    Self {
      store,
      events,
      ready: Notify::new(),
      tokens: Mutex::new(HashMap::new()),
    }
  }

  /// A queue over a fresh [`MemoryStore`].
  pub fn in_memory(events: Arc<dyn EventSink>) -> Self {
    Self::new(Arc::new(MemoryStore::new()), events)
  }

  pub fn store(&self) -> &Arc<dyn SessionStore> {
    &self.store
  }

  /// Submit a graph. Returns the new session id.
  #[instrument(skip(self, graph), fields(nodes = graph.nodes.len()))]
  pub async fn enqueue(
    &self,
    queue_id: &str,
    graph: GraphDef,
    priority: i32,
  ) -> Result<String, QueueError> {
    let session = NewSession {
      session_id: uuid::Uuid::new_v4().to_string(),
      queue_id: queue_id.to_string(),
      priority,
      graph,
      created_at: Utc::now(),
    };
    self.store.insert(&session).await?;

    info!(session_id = %session.session_id, "session_queued");
    self.emit(EventPayload::SessionQueued {
      queue_id: session.queue_id.clone(),
      session_id: session.session_id.clone(),
      priority,
    });
    self.ready.notify_waiters();

    Ok(session.session_id)
  }

  /// Submit a graph to the default queue at priority 0.
  pub async fn submit(&self, graph: GraphDef) -> Result<String, QueueError> {
    self.enqueue(DEFAULT_QUEUE_ID, graph, 0).await
  }

  /// Submit the same graph `runs` times.
  pub async fn enqueue_batch(
    &self,
    queue_id: &str,
    graph: GraphDef,
    runs: usize,
    priority: i32,
  ) -> Result<Vec<String>, QueueError> {
    let mut ids = Vec::with_capacity(runs);
    for _ in 0..runs {
      ids.push(self.enqueue(queue_id, graph.clone(), priority).await?);
    }
    Ok(ids)
  }

  /// Take the next queued session, if any, and mark it running.
  pub async fn dequeue(&self, queue_id: Option<&str>) -> Result<Option<Session>, QueueError> {
    let Some(record) = self.store.claim_next(queue_id, Utc::now()).await? else {
      return Ok(None);
    };

    // A cancel may have arrived between the claim and this point; it left a
    // pre-fired token behind.
    let cancel = self
      .tokens()
      .entry(record.session_id.clone())
      .or_default()
      .clone();
    if record.cancel_requested {
      cancel.cancel();
    }

    debug!(session_id = %record.session_id, "session_dequeued");
    Ok(Some(Session {
      session_id: record.session_id,
      queue_id: record.queue_id,
      priority: record.priority,
      graph: record.graph.0,
      cancel,
    }))
  }

  /// Wait for the next session.
  ///
  /// Returns `None` once `shutdown` fires. Idle waiting costs nothing: the
  /// task sleeps until a session is enqueued.
  pub async fn next(
    &self,
    queue_id: Option<&str>,
    shutdown: &CancellationToken,
  ) -> Result<Option<Session>, QueueError> {
    loop {
      // Register interest before checking, so an enqueue in between is not missed.
      let notified = self.ready.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if shutdown.is_cancelled() {
        return Ok(None);
      }
      if let Some(session) = self.dequeue(queue_id).await? {
        return Ok(Some(session));
      }

      tokio::select! {
        _ = shutdown.cancelled() => return Ok(None),
        _ = &mut notified => {}
      }
    }
  }

  /// Cancel a session.
  ///
  /// A queued session is canceled immediately. A running session is asked
  /// to stop and keeps `running` until the processor finishes it. Returns
  /// the state the session is in afterwards.
  #[instrument(skip(self))]
  pub async fn cancel(&self, session_id: &str) -> Result<SessionState, QueueError> {
    if self.store.cancel_queued(session_id, Utc::now()).await? {
      let record = self.store.get(session_id).await?;
      info!("session_canceled");
      self.emit_canceled(&record.queue_id, session_id);
      return Ok(SessionState::Canceled);
    }

    if self.store.request_cancel(session_id).await? {
      info!("session_cancel_requested");
      self.fire(session_id).await;
      return Ok(SessionState::Running);
    }

    Ok(self.store.get(session_id).await?.state)
  }

  /// Cancel every queued and running session of a queue.
  #[instrument(skip(self))]
  pub async fn cancel_all(&self, queue_id: &str) -> Result<CancelSummary, QueueError> {
    let canceled = self.store.cancel_all_queued(queue_id, Utc::now()).await?;
    for session_id in &canceled {
      self.emit_canceled(queue_id, session_id);
    }

    let requested = self.store.request_cancel_all(queue_id).await?;
    for session_id in &requested {
      self.fire(session_id).await;
    }

    info!(
      canceled = canceled.len(),
      requested = requested.len(),
      "queue_canceled"
    );
    Ok(CancelSummary {
      canceled,
      requested,
    })
  }

  pub async fn get_status(&self, session_id: &str) -> Result<SessionStatus, QueueError> {
    Ok(self.store.get(session_id).await?.status())
  }

  /// Full record, including the graph and any results.
  pub async fn get(&self, session_id: &str) -> Result<SessionRecord, QueueError> {
    self.store.get(session_id).await
  }

  pub async fn list(&self, queue_id: &str) -> Result<Vec<SessionStatus>, QueueError> {
    let records = self.store.list(queue_id).await?;
    Ok(records.iter().map(SessionRecord::status).collect())
  }

  pub async fn queue_status(&self, queue_id: &str) -> Result<QueueStatus, QueueError> {
    self.store.counts(queue_id).await
  }

  /// Drop completed, errored and canceled sessions. Returns how many.
  pub async fn prune(&self, queue_id: &str) -> Result<u64, QueueError> {
    let pruned = self.store.prune(queue_id).await?;
    info!(queue_id, pruned, "queue_pruned");
    Ok(pruned)
  }

  /// Stop every running session of a queue and delete all its sessions.
  pub async fn clear(&self, queue_id: &str) -> Result<u64, QueueError> {
    for session_id in self.store.request_cancel_all(queue_id).await? {
      self.fire(&session_id).await;
    }
    let deleted = self.store.clear(queue_id).await?;

    info!(queue_id, deleted, "queue_cleared");
    self.emit(EventPayload::QueueCleared {
      queue_id: queue_id.to_string(),
    });
    Ok(deleted)
  }

  /// Mark sessions left running by a previous process as errored.
  ///
  /// Call once at startup, before any worker dequeues.
  pub async fn recover(&self) -> Result<Vec<String>, QueueError> {
    let error = SessionError::new(
      "Interrupted",
      None,
      "session was running when the previous process stopped",
    );
    let interrupted = self.store.interrupt_running(&error, Utc::now()).await?;

    for session_id in &interrupted {
      warn!(session_id = %session_id, "session_interrupted");
      let queue_id = match self.store.get(session_id).await {
        Ok(record) => record.queue_id,
        Err(_) => continue,
      };
      self.emit(EventPayload::SessionErrored {
        queue_id,
        session_id: session_id.clone(),
        error_type: error.error_type.clone(),
        invocation_id: None,
        message: error.message.clone(),
      });
    }
    Ok(interrupted)
  }

  /// Record how the processor finished a running session.
  ///
  /// Fails with [`QueueError::InvalidTransition`] if the session is not
  /// running; terminal states never change.
  #[instrument(skip(self, outcome), fields(state = %outcome.state()))]
  pub async fn finish(
    &self,
    session_id: &str,
    outcome: SessionOutcome,
  ) -> Result<SessionState, QueueError> {
    let state = outcome.state();
    let finished = self
      .store
      .finish(
        session_id,
        state,
        outcome.results(),
        outcome.error(),
        Utc::now(),
      )
      .await;
    self.tokens().remove(session_id);

    if !finished? {
      let current = self.store.get(session_id).await?.state;
      return Err(QueueError::InvalidTransition {
        session_id: session_id.to_string(),
        from: current,
        to: state,
      });
    }

    debug!("session_finished");
    Ok(state)
  }

  /// Fire a running session's token.
  ///
  /// If the processor has not picked the token up yet, a pre-fired one is
  /// left for `dequeue`. It is dropped again if the session finished in the
  /// meantime, since `finish` has already cleaned up.
  async fn fire(&self, session_id: &str) {
    self
      .tokens()
      .entry(session_id.to_string())
      .or_default()
      .cancel();

    let running = matches!(
      self.store.get(session_id).await,
      Ok(record) if record.state == SessionState::Running
    );
    if !running {
      self.tokens().remove(session_id);
    }
  }

  fn tokens(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit_canceled(&self, queue_id: &str, session_id: &str) {
    self.emit(EventPayload::SessionCanceled {
      queue_id: queue_id.to_string(),
      session_id: session_id.to_string(),
    });
  }

  fn emit(&self, payload: EventPayload) {
    self.events.notify(Event::new(payload));
  }
}
