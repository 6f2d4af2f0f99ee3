use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cinder_cache::{InvocationCache, MemoryCache};
use cinder_events::{ChannelSink, Event, EventPayload};
use cinder_invocation::{
  InputSlot, Inputs, Invocation, InvocationContext, InvocationFailure, InvocationRegistry,
  KindSchema, Outputs, SlotType, require_i64,
};
use cinder_invoker::{InvokeError, InvokeRequest, Invoker, SessionContext};
use cinder_stats::StatsCollector;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Squares its input after an optional delay, counting executions.
struct Square {
  schema: KindSchema,
  delay: Duration,
  runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Invocation for Square {
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(&self, inputs: Inputs, _ctx: &InvocationContext) -> Result<Outputs, InvocationFailure> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(self.delay).await;
    let n = require_i64(&inputs, "n")?;
    Ok(Outputs::from([("value".to_string(), json!(n * n))]))
  }
}

struct Harness {
  invoker: Arc<Invoker>,
  cache: Arc<MemoryCache>,
  stats: Arc<StatsCollector>,
  events: UnboundedReceiver<Event>,
  runs: Arc<AtomicUsize>,
}

fn harness(delay: Duration) -> Harness {
  let runs = Arc::new(AtomicUsize::new(0));
  let mut registry = InvocationRegistry::with_builtins();
  registry.register(Arc::new(Square {
    schema: KindSchema::new("square")
      .input(InputSlot::required("n", SlotType::Integer))
      .output("value", SlotType::Integer),
    delay,
    runs: runs.clone(),
  }));
  let failures = runs.clone();
  registry.register_fn(
    KindSchema::new("explode").output("value", SlotType::Integer),
    move |_: &Inputs| {
      failures.fetch_add(1, Ordering::SeqCst);
      Err(InvocationFailure::new("Explosion", "kaboom"))
    },
  );

  let cache = Arc::new(MemoryCache::new(64));
  let stats = Arc::new(StatsCollector::new());
  stats.start_session("s1", "default");
  let (sink, events) = ChannelSink::channel();

  let invoker = Invoker::new(
    Arc::new(registry),
    cache.clone(),
    Arc::new(sink),
    stats.clone(),
  );

  Harness {
    invoker: Arc::new(invoker),
    cache,
    stats,
    events,
    runs,
  }
}

fn request(kind: &str, n: i64) -> InvokeRequest {
  InvokeRequest {
    invocation_id: "node".to_string(),
    node_id: "node".to_string(),
    kind: kind.to_string(),
    inputs: Inputs::from([("n".to_string(), json!(n))]),
    use_cache: true,
    timeout_ms: None,
  }
}

fn session() -> SessionContext {
  SessionContext::new("s1", "default", CancellationToken::new())
}

fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
  let mut out = Vec::new();
  while let Ok(event) = events.try_recv() {
    out.push(event);
  }
  out
}

#[tokio::test]
async fn test_second_identical_invoke_hits_cache() {
  let mut h = harness(Duration::ZERO);
  let session = session();

  let first = h.invoker.invoke(request("square", 7), &session).await.unwrap();
  let second = h.invoker.invoke(request("square", 7), &session).await.unwrap();

  assert_eq!(first["value"], 49);
  assert_eq!(first, second);
  assert_eq!(h.runs.load(Ordering::SeqCst), 1);

  let kind = h.stats.kind("square");
  assert_eq!(kind.calls, 2);
  assert_eq!(kind.cache_hits, 1);
  assert_eq!(h.cache.status().hits, 1);

  let cached: Vec<bool> = drain(&mut h.events)
    .into_iter()
    .filter_map(|e| match e.payload {
      EventPayload::InvocationCompleted { cached, .. } => Some(cached),
      _ => None,
    })
    .collect();
  assert_eq!(cached, vec![false, true]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_invocations_run_once() {
  let h = harness(Duration::from_millis(50));
  let session = session();

  let calls = (0..8).map(|_| {
    let invoker = h.invoker.clone();
    let session = session.clone();
    tokio::spawn(async move { invoker.invoke(request("square", 3), &session).await })
  });
  let results = futures::future::join_all(calls).await;

  for result in results {
    assert_eq!(result.unwrap().unwrap()["value"], 9);
  }
  assert_eq!(h.runs.load(Ordering::SeqCst), 1);
  assert_eq!(h.stats.kind("square").cache_hits, 7);
}

#[tokio::test]
async fn test_different_inputs_run_separately() {
  let h = harness(Duration::ZERO);
  let session = session();

  h.invoker.invoke(request("square", 2), &session).await.unwrap();
  h.invoker.invoke(request("square", 3), &session).await.unwrap();
  assert_eq!(h.runs.load(Ordering::SeqCst), 2);
  assert_eq!(h.cache.status().size, 2);
}

#[tokio::test]
async fn test_failure_is_reported_and_not_cached() {
  let mut h = harness(Duration::ZERO);
  let session = session();

  for _ in 0..2 {
    let err = h.invoker.invoke(request("explode", 0), &session).await.unwrap_err();
    assert_eq!(
      err,
      InvokeError::Failed {
        invocation_id: "node".to_string(),
        error_type: "Explosion".to_string(),
        message: "kaboom".to_string(),
      }
    );
  }
  assert_eq!(h.runs.load(Ordering::SeqCst), 2);
  assert_eq!(h.cache.status().size, 0);
  assert_eq!(h.stats.kind("explode").failures, 2);

  let error_events = drain(&mut h.events)
    .into_iter()
    .filter(|e| matches!(&e.payload, EventPayload::InvocationError { error_type, .. } if error_type == "Explosion"))
    .count();
  assert_eq!(error_events, 2);
}

#[tokio::test]
async fn test_use_cache_false_bypasses_cache() {
  let h = harness(Duration::ZERO);
  let session = session();

  for _ in 0..2 {
    let mut req = request("square", 4);
    req.use_cache = false;
    h.invoker.invoke(req, &session).await.unwrap();
  }
  assert_eq!(h.runs.load(Ordering::SeqCst), 2);
  assert_eq!(h.cache.status().size, 0);
}

#[tokio::test]
async fn test_canceled_before_start_never_runs() {
  let mut h = harness(Duration::ZERO);
  let cancel = CancellationToken::new();
  cancel.cancel();
  let session = SessionContext::new("s1", "default", cancel);

  let err = h.invoker.invoke(request("square", 1), &session).await.unwrap_err();
  assert!(err.is_canceled());
  assert_eq!(h.runs.load(Ordering::SeqCst), 0);
  assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn test_cancel_during_execution_aborts_body() {
  let mut h = harness(Duration::from_secs(30));
  let session = session();

  let canceler = session.cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    canceler.cancel();
  });

  let result = tokio::time::timeout(
    Duration::from_secs(5),
    h.invoker.invoke(request("square", 5), &session),
  )
  .await
  .expect("cancellation should interrupt the body");

  assert!(matches!(result, Err(InvokeError::Canceled { .. })));
  assert_eq!(h.cache.status().size, 0);

  let events = drain(&mut h.events);
  assert!(matches!(
    events.as_slice(),
    [
      Event { payload: EventPayload::InvocationStarted { .. }, .. },
      Event { payload: EventPayload::InvocationError { error_type, .. }, .. },
    ] if error_type == "Canceled"
  ));
}

#[tokio::test]
async fn test_node_timeout() {
  let mut h = harness(Duration::from_secs(30));
  let session = session();

  let mut req = request("square", 5);
  req.timeout_ms = Some(20);
  let err = h.invoker.invoke(req, &session).await.unwrap_err();

  assert_eq!(
    err,
    InvokeError::TimedOut {
      invocation_id: "node".to_string(),
      timeout_ms: 20,
    }
  );
  assert_eq!(err.error_type(), "TimedOut");
  assert!(drain(&mut h.events).iter().any(|e| matches!(
    &e.payload,
    EventPayload::InvocationError { error_type, .. } if error_type == "TimedOut"
  )));
}

#[tokio::test]
async fn test_default_timeout_applies() {
  let runs = Arc::new(AtomicUsize::new(0));
  let mut registry = InvocationRegistry::new();
  registry.register(Arc::new(Square {
    schema: KindSchema::new("square")
      .input(InputSlot::required("n", SlotType::Integer))
      .output("value", SlotType::Integer),
    delay: Duration::from_secs(30),
    runs,
  }));
  let invoker = Invoker::new(
    Arc::new(registry),
    Arc::new(MemoryCache::new(8)),
    Arc::new(cinder_events::NoopSink),
    Arc::new(StatsCollector::new()),
  )
  .with_default_timeout(Some(Duration::from_millis(20)));

  let err = invoker.invoke(request("square", 1), &session()).await.unwrap_err();
  assert!(matches!(err, InvokeError::TimedOut { timeout_ms: 20, .. }));
}

#[tokio::test]
async fn test_model_load_failure_is_invocation_error() {
  let h = harness(Duration::ZERO);
  let req = InvokeRequest {
    invocation_id: "loader".to_string(),
    node_id: "loader".to_string(),
    kind: "load_model".to_string(),
    inputs: Inputs::from([("model".to_string(), json!({ "key": "sdxl-base" }))]),
    use_cache: true,
    timeout_ms: None,
  };

  let err = h.invoker.invoke(req, &session()).await.unwrap_err();
  assert_eq!(err.error_type(), "ModelLoadError");
  assert_eq!(err.invocation_id(), "loader");
}

#[tokio::test]
async fn test_unknown_kind() {
  let h = harness(Duration::ZERO);
  let err = h.invoker.invoke(request("teleport", 1), &session()).await.unwrap_err();
  assert!(matches!(err, InvokeError::UnknownKind { .. }));
}
