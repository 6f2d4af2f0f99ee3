//! Single invocation execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cinder_cache::{Fingerprint, InvocationCache};
use cinder_events::{Event, EventPayload, EventSink};
use cinder_invocation::{
  Inputs, Invocation, InvocationContext, InvocationFailure, InvocationRegistry, Outputs, Services,
};
use cinder_stats::{InvocationSample, StatsCollector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::InvokeError;
use crate::lock::LockTable;

/// One invocation to run.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
  /// Instance id: the node id, plus the item index path inside iterations.
  pub invocation_id: String,
  pub node_id: String,
  pub kind: String,
  pub inputs: Inputs,
  /// False bypasses the cache and the lock table.
  pub use_cache: bool,
  /// Overrides the invoker's default time limit.
  pub timeout_ms: Option<u64>,
}

/// The session an invocation runs on behalf of.
#[derive(Debug, Clone)]
pub struct SessionContext {
  pub session_id: String,
  pub queue_id: String,
  pub cancel: CancellationToken,
}

impl SessionContext {
  pub fn new(
    session_id: impl Into<String>,
    queue_id: impl Into<String>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      session_id: session_id.into(),
      queue_id: queue_id.into(),
      cancel,
    }
  }
}

/// Runs invocations with memoization.
///
/// Cacheable invocations are looked up by fingerprint first. On a miss the
/// fingerprint's lock is taken and the cache checked again, so concurrent
/// requests for the same work run the body once and the rest read its result.
pub struct Invoker {
  registry: Arc<InvocationRegistry>,
  cache: Arc<dyn InvocationCache>,
  locks: LockTable,
  events: Arc<dyn EventSink>,
  stats: Arc<StatsCollector>,
  services: Services,
  default_timeout: Option<Duration>,
}

enum BodyOutcome {
  Done(Outputs),
  Failed(InvocationFailure),
  TimedOut(u64),
}

impl Invoker {
  pub fn new(
    registry: Arc<InvocationRegistry>,
    cache: Arc<dyn InvocationCache>,
    events: Arc<dyn EventSink>,
    stats: Arc<StatsCollector>,
  ) -> Self {
    Self {
      registry,
      cache,
      locks: LockTable::new(),
      events,
      stats,
      services: Services::default(),
      default_timeout: None,
    }
  }

  /// Use these services instead of the in-memory record store and null
  /// model loader.
  pub fn with_services(mut self, services: Services) -> Self {
    self.services = services;
    self
  }

  /// Time limit for nodes that don't set their own.
  pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.default_timeout = timeout;
    self
  }

  pub fn registry(&self) -> &Arc<InvocationRegistry> {
    &self.registry
  }

  pub fn cache(&self) -> &Arc<dyn InvocationCache> {
    &self.cache
  }

  pub fn stats(&self) -> &Arc<StatsCollector> {
    &self.stats
  }

  /// Run one invocation and return its outputs.
  #[instrument(
    name = "invoke",
    skip(self, request, session),
    fields(
      session_id = %session.session_id,
      invocation_id = %request.invocation_id,
      kind = %request.kind,
    )
  )]
  pub async fn invoke(
    &self,
    request: InvokeRequest,
    session: &SessionContext,
  ) -> Result<Outputs, InvokeError> {
    if session.cancel.is_cancelled() {
      return Err(canceled(&request));
    }

    let invocation = self
      .registry
      .get(&request.kind)
      .ok_or_else(|| InvokeError::UnknownKind {
        invocation_id: request.invocation_id.clone(),
        kind: request.kind.clone(),
      })?;

    self.emit(EventPayload::InvocationStarted {
      queue_id: session.queue_id.clone(),
      session_id: session.session_id.clone(),
      invocation_id: request.invocation_id.clone(),
      node_id: request.node_id.clone(),
      kind: request.kind.clone(),
    });

    let fingerprint = self.fingerprint(invocation.as_ref(), &request);
    let Some(fingerprint) = fingerprint else {
      return self.run(invocation.as_ref(), &request, session).await;
    };

    if let Some(hit) = self.cache.get(&fingerprint) {
      return Ok(self.complete_cached(&request, session, &hit));
    }

    let _guard = tokio::select! {
      biased;
      _ = session.cancel.cancelled() => return Err(self.report_canceled(&request, session)),
      guard = self.locks.acquire(&fingerprint) => guard,
    };

    // Another holder may have finished the same work while we waited.
    if let Some(hit) = self.cache.get(&fingerprint) {
      return Ok(self.complete_cached(&request, session, &hit));
    }

    let outputs = self.run(invocation.as_ref(), &request, session).await?;
    self.cache.put(fingerprint, outputs.clone(), 1);
    Ok(outputs)
  }

  /// Fingerprint for cacheable requests, `None` when the cache is bypassed.
  fn fingerprint(&self, invocation: &dyn Invocation, request: &InvokeRequest) -> Option<Fingerprint> {
    let schema = invocation.schema();
    if !request.use_cache || !schema.cacheable {
      return None;
    }

    match Fingerprint::compute(&request.kind, &request.inputs, &schema.cache_exempt) {
      Ok(fingerprint) => Some(fingerprint),
      Err(e) => {
        warn!(error = %e, "fingerprint_failed");
        None
      }
    }
  }

  /// Execute the body and report the outcome.
  async fn run(
    &self,
    invocation: &dyn Invocation,
    request: &InvokeRequest,
    session: &SessionContext,
  ) -> Result<Outputs, InvokeError> {
    let started = Instant::now();
    let outcome = self.run_body(invocation, request, session).await;
    let duration = started.elapsed();

    // A body that finished after cancellation is discarded.
    let outcome = match outcome {
      Some(_) if session.cancel.is_cancelled() => None,
      other => other,
    };

    match outcome {
      None => Err(self.report_canceled(request, session)),
      Some(BodyOutcome::Done(outputs)) => {
        self.record(session, request, InvocationSample::executed(duration));
        info!(elapsed_ms = duration.as_millis() as u64, "invocation_completed");
        self.emit_completed(request, session, &outputs, false);
        Ok(outputs)
      }
      Some(BodyOutcome::Failed(failure)) => {
        self.record(session, request, InvocationSample::failed(duration));
        self.report_failure(request, session, &failure.error_type, &failure.message);
        Err(InvokeError::Failed {
          invocation_id: request.invocation_id.clone(),
          error_type: failure.error_type,
          message: failure.message,
        })
      }
      Some(BodyOutcome::TimedOut(timeout_ms)) => {
        self.record(session, request, InvocationSample::failed(duration));
        let message = format!("no result after {}ms", timeout_ms);
        self.report_failure(request, session, "TimedOut", &message);
        Err(InvokeError::TimedOut {
          invocation_id: request.invocation_id.clone(),
          timeout_ms,
        })
      }
    }
  }

  /// Race the body against cancellation and its time limit.
  ///
  /// Returns `None` if the session was canceled first.
  async fn run_body(
    &self,
    invocation: &dyn Invocation,
    request: &InvokeRequest,
    session: &SessionContext,
  ) -> Option<BodyOutcome> {
    let ctx = InvocationContext::new(
      session.session_id.clone(),
      session.queue_id.clone(),
      request.invocation_id.clone(),
      session.cancel.clone(),
      self.services.clone(),
    );
    let body = invocation.invoke(request.inputs.clone(), &ctx);
    let limit = request
      .timeout_ms
      .map(Duration::from_millis)
      .or(self.default_timeout);

    let bounded = async {
      match limit {
        Some(limit) => match tokio::time::timeout(limit, body).await {
          Ok(result) => result.map_or_else(BodyOutcome::Failed, BodyOutcome::Done),
          Err(_) => BodyOutcome::TimedOut(limit.as_millis() as u64),
        },
        None => body
          .await
          .map_or_else(BodyOutcome::Failed, BodyOutcome::Done),
      }
    };

    tokio::select! {
      biased;
      _ = session.cancel.cancelled() => None,
      outcome = bounded => Some(outcome),
    }
  }

  fn complete_cached(
    &self,
    request: &InvokeRequest,
    session: &SessionContext,
    outputs: &Outputs,
  ) -> Outputs {
    debug!("cache_hit");
    self.record(session, request, InvocationSample::cache_hit());
    self.emit_completed(request, session, outputs, true);
    outputs.clone()
  }

  fn report_failure(
    &self,
    request: &InvokeRequest,
    session: &SessionContext,
    error_type: &str,
    message: &str,
  ) {
    warn!(error_type, message, "invocation_failed");
    self.emit(EventPayload::InvocationError {
      queue_id: session.queue_id.clone(),
      session_id: session.session_id.clone(),
      invocation_id: request.invocation_id.clone(),
      node_id: request.node_id.clone(),
      kind: request.kind.clone(),
      error_type: error_type.to_string(),
      message: message.to_string(),
    });
  }

  /// Close out a started invocation that was canceled before it finished.
  fn report_canceled(&self, request: &InvokeRequest, session: &SessionContext) -> InvokeError {
    debug!("invocation_canceled");
    self.emit(EventPayload::InvocationError {
      queue_id: session.queue_id.clone(),
      session_id: session.session_id.clone(),
      invocation_id: request.invocation_id.clone(),
      node_id: request.node_id.clone(),
      kind: request.kind.clone(),
      error_type: "Canceled".to_string(),
      message: "session was canceled".to_string(),
    });
    canceled(request)
  }

  fn emit_completed(
    &self,
    request: &InvokeRequest,
    session: &SessionContext,
    outputs: &Outputs,
    cached: bool,
  ) {
    self.emit(EventPayload::InvocationCompleted {
      queue_id: session.queue_id.clone(),
      session_id: session.session_id.clone(),
      invocation_id: request.invocation_id.clone(),
      node_id: request.node_id.clone(),
      kind: request.kind.clone(),
      cached,
      outputs: serde_json::Value::Object(
        outputs
          .iter()
          .map(|(k, v)| (k.clone(), v.clone()))
          .collect(),
      ),
    });
  }

  fn emit(&self, payload: EventPayload) {
    self.events.notify(Event::new(payload));
  }

  fn record(&self, session: &SessionContext, request: &InvokeRequest, sample: InvocationSample) {
    if let Err(e) = self.stats.record(&session.session_id, &request.kind, sample) {
      warn!(error = %e, "stats_unavailable");
    }
  }
}

fn canceled(request: &InvokeRequest) -> InvokeError {
  InvokeError::Canceled {
    invocation_id: request.invocation_id.clone(),
  }
}
