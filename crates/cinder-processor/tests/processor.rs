use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cinder_cache::MemoryCache;
use cinder_config::{EdgeDef, GraphDef, NodeDef};
use cinder_events::{ChannelSink, Event, EventPayload, EventSink};
use cinder_invocation::{
  InputSlot, Inputs, Invocation, InvocationContext, InvocationFailure, InvocationRegistry,
  KindSchema, Outputs, SlotType, require_i64,
};
use cinder_invoker::Invoker;
use cinder_processor::{ProcessorConfig, SessionProcessor};
use cinder_queue::{SessionQueue, SessionState};
use cinder_stats::StatsCollector;
use serde_json::json;
use tokio::sync::Barrier;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Sleeps for `ms` milliseconds, then echoes it.
struct Slow {
  schema: KindSchema,
}

#[async_trait]
impl Invocation for Slow {
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(&self, inputs: Inputs, _ctx: &InvocationContext) -> Result<Outputs, InvocationFailure> {
    let ms = require_i64(&inputs, "ms")?;
    tokio::time::sleep(Duration::from_millis(ms as u64)).await;
    Ok(Outputs::from([("value".to_string(), json!(ms))]))
  }
}

/// Finishes only once two invocations are inside it at the same time.
struct Rendezvous {
  schema: KindSchema,
  barrier: Barrier,
}

#[async_trait]
impl Invocation for Rendezvous {
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(&self, inputs: Inputs, _ctx: &InvocationContext) -> Result<Outputs, InvocationFailure> {
    self.barrier.wait().await;
    let value = require_i64(&inputs, "value")?;
    Ok(Outputs::from([("value".to_string(), json!(value))]))
  }
}

struct Harness {
  queue: Arc<SessionQueue>,
  processor: Arc<SessionProcessor>,
  stats: Arc<StatsCollector>,
  events: UnboundedReceiver<Event>,
}

fn harness(config: ProcessorConfig) -> Harness {
  let mut registry = InvocationRegistry::with_builtins();
  registry.register(Arc::new(Slow {
    schema: KindSchema::new("slow")
      .input(InputSlot::with_default("ms", SlotType::Integer, json!(10_000)))
      .output("value", SlotType::Integer),
  }));
  registry.register(Arc::new(Rendezvous {
    schema: KindSchema::new("rendezvous")
      .input(InputSlot::required("value", SlotType::Integer))
      .output("value", SlotType::Integer),
    barrier: Barrier::new(2),
  }));
  registry.register_fn(
    KindSchema::new("explode")
      .input(InputSlot::with_default("value", SlotType::Integer, json!(0)))
      .output("value", SlotType::Integer),
    |_: &Inputs| Err(InvocationFailure::new("Explosion", "kaboom")),
  );

  let (sink, events) = ChannelSink::channel();
  let sink: Arc<dyn EventSink> = Arc::new(sink);
  let stats = Arc::new(StatsCollector::new());
  let invoker = Invoker::new(
    Arc::new(registry),
    Arc::new(MemoryCache::new(256)),
    sink.clone(),
    stats.clone(),
  );

  let queue = Arc::new(SessionQueue::in_memory(sink.clone()));
  let processor =
    SessionProcessor::new(queue.clone(), Arc::new(invoker), sink).with_config(config);

  Harness {
    queue,
    processor: Arc::new(processor),
    stats,
    events,
  }
}

/// A(5) -> B(x2) -> C(+1)
fn chain() -> GraphDef {
  GraphDef::new()
    .with_node(NodeDef::new("a", "integer").with_input("value", json!(5)))
    .with_node(NodeDef::new("b", "multiply").with_input("b", json!(2)))
    .with_node(NodeDef::new("c", "add").with_input("b", json!(1)))
    .with_edge(EdgeDef::new(("a", "value"), ("b", "a")))
    .with_edge(EdgeDef::new(("b", "value"), ("c", "a")))
}

async fn run_one(h: &Harness, graph: GraphDef) -> (String, SessionState) {
  let id = h.queue.submit(graph).await.unwrap();
  let session = h.queue.dequeue(None).await.unwrap().unwrap();
  assert_eq!(session.session_id, id);
  let state = h.processor.process(session).await.unwrap();
  (id, state)
}

async fn wait_for(events: &mut UnboundedReceiver<Event>, matches: impl Fn(&Event) -> bool) -> Event {
  tokio::time::timeout(Duration::from_secs(5), async {
    while let Some(event) = events.recv().await {
      if matches(&event) {
        return event;
      }
    }
    panic!("event channel closed");
  })
  .await
  .expect("timed out waiting for event")
}

fn drain(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
  let mut out = Vec::new();
  while let Ok(event) = events.try_recv() {
    out.push(event);
  }
  out
}

fn started(event: &Event, node: &str) -> bool {
  matches!(&event.payload, EventPayload::InvocationStarted { node_id, .. } if node_id == node)
}

#[tokio::test]
async fn test_chain_completes_and_resubmit_hits_cache() {
  let mut h = harness(ProcessorConfig::default());

  let (first, state) = run_one(&h, chain()).await;
  assert_eq!(state, SessionState::Completed);

  let record = h.queue.get(&first).await.unwrap();
  assert_eq!(record.results.0["c"]["value"], json!(11));
  assert_eq!(record.results.0["b"]["value"], json!(10));

  let executions: u64 = h.stats.kinds().values().map(|k| k.executions()).sum();
  assert_eq!(executions, 3);

  let (second, state) = run_one(&h, chain()).await;
  assert_eq!(state, SessionState::Completed);
  assert_eq!(h.queue.get(&second).await.unwrap().results.0["c"]["value"], json!(11));

  let executions: u64 = h.stats.kinds().values().map(|k| k.executions()).sum();
  assert_eq!(executions, 3);
  let hits: u64 = h.stats.kinds().values().map(|k| k.cache_hits).sum();
  assert_eq!(hits, 3);

  let terminal: Vec<_> = drain(&mut h.events)
    .into_iter()
    .filter(|e| e.is_terminal())
    .collect();
  assert_eq!(terminal.len(), 2);
  assert!(matches!(
    &terminal[1].payload,
    EventPayload::SessionCompleted { session_id, .. } if *session_id == second
  ));
}

#[tokio::test]
async fn test_failing_node_stops_session() {
  let mut h = harness(ProcessorConfig::default());
  let graph = GraphDef::new()
    .with_node(NodeDef::new("a", "integer").with_input("value", json!(1)))
    .with_node(NodeDef::new("boom", "explode"))
    .with_node(NodeDef::new("c", "add"))
    .with_edge(EdgeDef::new(("a", "value"), ("boom", "value")))
    .with_edge(EdgeDef::new(("boom", "value"), ("c", "a")));

  let (id, state) = run_one(&h, graph).await;
  assert_eq!(state, SessionState::Errored);

  let record = h.queue.get(&id).await.unwrap();
  let error = record.error.unwrap().0;
  assert_eq!(error.error_type, "InvocationError");
  assert_eq!(error.invocation_id.as_deref(), Some("boom"));
  assert!(error.message.contains("kaboom"));
  assert!(record.results.0.contains_key("a"));
  assert!(!record.results.0.contains_key("c"));

  let events = drain(&mut h.events);
  assert!(!events.iter().any(|e| started(e, "c")));
  assert!(matches!(
    &events.last().unwrap().payload,
    EventPayload::SessionErrored { invocation_id: Some(failed), .. } if failed == "boom"
  ));
}

#[tokio::test]
async fn test_resolution_error_runs_nothing() {
  let mut h = harness(ProcessorConfig::default());
  let graph = GraphDef::new()
    .with_node(NodeDef::new("a", "add"))
    .with_node(NodeDef::new("b", "add"))
    .with_edge(EdgeDef::new(("a", "value"), ("b", "a")))
    .with_edge(EdgeDef::new(("b", "value"), ("a", "a")));

  let (id, state) = run_one(&h, graph).await;
  assert_eq!(state, SessionState::Errored);

  let error = h.queue.get_status(&id).await.unwrap().error.unwrap();
  assert_eq!(error.error_type, "ResolutionError");
  assert_eq!(error.invocation_id, None);
  assert!(h.stats.kinds().is_empty());
  assert!(
    !drain(&mut h.events)
      .iter()
      .any(|e| matches!(e.payload, EventPayload::InvocationStarted { .. }))
  );
}

#[tokio::test]
async fn test_cancel_while_queued_never_runs() {
  let h = harness(ProcessorConfig::default());
  let id = h.queue.submit(chain()).await.unwrap();

  assert_eq!(h.queue.cancel(&id).await.unwrap(), SessionState::Canceled);
  assert!(h.queue.dequeue(None).await.unwrap().is_none());
  assert!(h.stats.kinds().is_empty());
}

#[tokio::test]
async fn test_cancel_while_running_stops_at_boundary() {
  let mut h = harness(ProcessorConfig::default());
  let graph = GraphDef::new()
    .with_node(NodeDef::new("wait", "slow"))
    .with_node(NodeDef::new("after", "add"))
    .with_edge(EdgeDef::new(("wait", "value"), ("after", "a")));

  let id = h.queue.submit(graph).await.unwrap();
  let session = h.queue.dequeue(None).await.unwrap().unwrap();
  let processing = {
    let processor = h.processor.clone();
    tokio::spawn(async move { processor.process(session).await })
  };

  wait_for(&mut h.events, |e| started(e, "wait")).await;
  assert_eq!(h.queue.cancel(&id).await.unwrap(), SessionState::Running);

  let state = tokio::time::timeout(Duration::from_secs(5), processing)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  assert_eq!(state, SessionState::Canceled);

  let record = h.queue.get(&id).await.unwrap();
  assert_eq!(record.state, SessionState::Canceled);
  assert!(record.results.0.is_empty());
  assert!(!drain(&mut h.events).iter().any(|e| started(e, "after")));
}

#[tokio::test]
async fn test_node_timeout_errors_session() {
  let h = harness(ProcessorConfig::default());
  let graph = GraphDef::new().with_node(NodeDef::new("wait", "slow").with_timeout_ms(20));

  let (id, state) = run_one(&h, graph).await;
  assert_eq!(state, SessionState::Errored);

  let error = h.queue.get_status(&id).await.unwrap().error.unwrap();
  assert_eq!(error.error_type, "TimedOut");
  assert_eq!(error.invocation_id.as_deref(), Some("wait"));
}

#[tokio::test]
async fn test_iterate_collect_preserves_item_order() {
  let mut h = harness(ProcessorConfig::default());
  let graph = GraphDef::new()
    .with_node(NodeDef::new("range", "range").with_input("stop", json!(4)))
    .with_node(NodeDef::new("each", "iterate"))
    .with_node(NodeDef::new("double", "multiply").with_input("b", json!(10)))
    .with_node(NodeDef::new("gather", "collect"))
    .with_edge(EdgeDef::new(("range", "collection"), ("each", "collection")))
    .with_edge(EdgeDef::new(("each", "item"), ("double", "a")))
    .with_edge(EdgeDef::new(("double", "value"), ("gather", "item")));

  let (id, state) = run_one(&h, graph).await;
  assert_eq!(state, SessionState::Completed);

  let results = h.queue.get(&id).await.unwrap().results.0;
  assert_eq!(results["gather"]["collection"], json!([0, 10, 20, 30]));
  assert_eq!(results["double[2]"]["value"], json!(20));
  assert_eq!(results["each[3]"]["index"], json!(3));
  assert_eq!(results["each[3]"]["total"], json!(4));

  let doubles: Vec<String> = drain(&mut h.events)
    .into_iter()
    .filter_map(|e| match e.payload {
      EventPayload::InvocationStarted {
        node_id,
        invocation_id,
        ..
      } if node_id == "double" => Some(invocation_id),
      _ => None,
    })
    .collect();
  assert_eq!(doubles, vec!["double[0]", "double[1]", "double[2]", "double[3]"]);
}

#[tokio::test]
async fn test_items_reuse_cache_across_sessions() {
  let h = harness(ProcessorConfig::default());
  let graph = GraphDef::new()
    .with_node(NodeDef::new("range", "range").with_input("stop", json!(3)))
    .with_node(NodeDef::new("each", "iterate"))
    .with_node(NodeDef::new("double", "multiply").with_input("b", json!(2)))
    .with_edge(EdgeDef::new(("range", "collection"), ("each", "collection")))
    .with_edge(EdgeDef::new(("each", "item"), ("double", "a")));

  run_one(&h, graph.clone()).await;
  assert_eq!(h.stats.kind("multiply").executions(), 3);

  run_one(&h, graph).await;
  let multiply = h.stats.kind("multiply");
  assert_eq!(multiply.executions(), 3);
  assert_eq!(multiply.cache_hits, 3);
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
  let h = harness(ProcessorConfig {
    node_concurrency: 2,
    ..Default::default()
  });
  let graph = GraphDef::new()
    .with_node(NodeDef::new("left", "rendezvous").with_input("value", json!(1)))
    .with_node(NodeDef::new("right", "rendezvous").with_input("value", json!(2)))
    .with_node(NodeDef::new("sum", "add"))
    .with_edge(EdgeDef::new(("left", "value"), ("sum", "a")))
    .with_edge(EdgeDef::new(("right", "value"), ("sum", "b")));

  let (id, state) = tokio::time::timeout(Duration::from_secs(5), run_one(&h, graph))
    .await
    .expect("independent steps did not overlap");
  assert_eq!(state, SessionState::Completed);
  assert_eq!(
    h.queue.get(&id).await.unwrap().results.0["sum"]["value"],
    json!(3)
  );
}

#[tokio::test]
async fn test_invocation_count_after_n_sessions() {
  let h = harness(ProcessorConfig::default());
  let mut last_total = Duration::ZERO;

  for n in 0..5 {
    let graph =
      GraphDef::new().with_node(NodeDef::new("a", "integer").with_input("value", json!(n)));
    let (_, state) = run_one(&h, graph).await;
    assert_eq!(state, SessionState::Completed);

    let integer = h.stats.kind("integer");
    assert!(integer.total_time >= last_total);
    last_total = integer.total_time;
  }

  assert_eq!(h.stats.kind("integer").calls, 5);
  assert_eq!(h.stats.tracked_sessions(), 0);
}

#[tokio::test]
async fn test_workers_drain_queue() {
  let mut h = harness(ProcessorConfig {
    workers: 2,
    ..Default::default()
  });
  let shutdown = CancellationToken::new();
  let workers = h.processor.start(shutdown.clone());
  assert_eq!(workers.len(), 2);

  let ids = h.queue.enqueue_batch("default", chain(), 4, 0).await.unwrap();
  for _ in 0..ids.len() {
    wait_for(&mut h.events, Event::is_terminal).await;
  }

  shutdown.cancel();
  for worker in workers {
    worker.await.unwrap();
  }

  let status = h.queue.queue_status("default").await.unwrap();
  assert_eq!(status.completed, 4);
  for id in &ids {
    assert_eq!(
      h.queue.get(id).await.unwrap().results.0["c"]["value"],
      json!(11)
    );
  }
}

#[tokio::test]
async fn test_shutdown_cancels_running_session() {
  let mut h = harness(ProcessorConfig::default());
  let shutdown = CancellationToken::new();
  let workers = h.processor.start(shutdown.clone());

  let id = h
    .queue
    .submit(GraphDef::new().with_node(NodeDef::new("wait", "slow")))
    .await
    .unwrap();
  wait_for(&mut h.events, |e| started(e, "wait")).await;

  shutdown.cancel();
  for worker in workers {
    tokio::time::timeout(Duration::from_secs(5), worker)
      .await
      .unwrap()
      .unwrap();
  }

  assert_eq!(
    h.queue.get_status(&id).await.unwrap().state,
    SessionState::Canceled
  );
}
