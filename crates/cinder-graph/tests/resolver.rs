use std::sync::Arc;

use cinder_config::{EdgeDef, GraphDef, NodeDef};
use cinder_graph::{NodeRole, PlanStep, ResolutionError, Resolver};
use cinder_invocation::{InputSlot, InvocationRegistry, KindSchema, Outputs, SlotType};
use serde_json::json;

fn resolver() -> Resolver {
  let mut registry = InvocationRegistry::with_builtins();
  registry.register_fn(
    KindSchema::new("render")
      .input(InputSlot::required("latents", SlotType::Latents))
      .output("image", SlotType::Image),
    |_| Ok(Outputs::new()),
  );
  registry.register_fn(
    KindSchema::new("pair")
      .input(InputSlot::required("x", SlotType::Integer))
      .input(InputSlot::required("y", SlotType::Integer))
      .output("value", SlotType::Integer),
    |_| Ok(Outputs::new()),
  );
  Resolver::new(Arc::new(registry))
}

fn add(id: &str) -> NodeDef {
  NodeDef::new(id, "add")
}

fn position(order: &[String], id: &str) -> usize {
  order.iter().position(|n| n == id).unwrap()
}

#[test]
fn test_edges_order_upstream_first() {
  // Declared backwards on purpose.
  let def = GraphDef::new()
    .with_node(add("c"))
    .with_node(add("b"))
    .with_node(add("a").with_input("a", json!(5)))
    .with_edge(EdgeDef::new(("a", "value"), ("b", "a")))
    .with_edge(EdgeDef::new(("b", "value"), ("c", "a")));

  let plan = resolver().resolve(&def).unwrap();
  let order = plan.order();

  for edge in &def.edges {
    assert!(position(&order, &edge.source.node_id) < position(&order, &edge.destination.node_id));
  }
  assert_eq!(order, vec!["a", "b", "c"]);
  assert_eq!(plan.steps[1].after(), &["a".to_string()]);
}

#[test]
fn test_independent_nodes_keep_declaration_order() {
  let def = GraphDef::new()
    .with_node(add("x"))
    .with_node(add("y"))
    .with_node(add("z"))
    .with_edge(EdgeDef::new(("x", "value"), ("z", "a")))
    .with_edge(EdgeDef::new(("y", "value"), ("z", "b")));

  let plan = resolver().resolve(&def).unwrap();
  assert_eq!(plan.order(), vec!["x", "y", "z"]);
  assert!(plan.steps[0].after().is_empty());
  assert!(plan.steps[1].after().is_empty());
  assert_eq!(plan.steps[2].after(), &["x".to_string(), "y".to_string()]);
}

#[test]
fn test_cycle_is_rejected() {
  let def = GraphDef::new()
    .with_node(add("a"))
    .with_node(add("b"))
    .with_edge(EdgeDef::new(("a", "value"), ("b", "a")))
    .with_edge(EdgeDef::new(("b", "value"), ("a", "a")));

  let err = resolver().resolve(&def).unwrap_err();
  assert_eq!(
    err,
    ResolutionError::CycleDetected {
      nodes: vec!["a".to_string(), "b".to_string()]
    }
  );
}

#[test]
fn test_cycle_reported_before_binding_errors() {
  // b.y is unbound and a literal has the wrong type, but the cycle wins.
  let def = GraphDef::new()
    .with_node(NodeDef::new("a", "pair").with_input("y", json!("nope")))
    .with_node(NodeDef::new("b", "pair"))
    .with_edge(EdgeDef::new(("a", "value"), ("b", "x")))
    .with_edge(EdgeDef::new(("b", "value"), ("a", "x")));

  let err = resolver().resolve(&def).unwrap_err();
  assert_eq!(
    err,
    ResolutionError::CycleDetected {
      nodes: vec!["a".to_string(), "b".to_string()]
    }
  );
}

#[test]
fn test_unbound_required_input() {
  let def = GraphDef::new().with_node(NodeDef::new("each", "iterate"));

  let err = resolver().resolve(&def).unwrap_err();
  assert_eq!(
    err,
    ResolutionError::UnboundInput {
      node_id: "each".to_string(),
      field: "collection".to_string()
    }
  );
}

#[test]
fn test_defaults_fill_unbound_optional_inputs() {
  let def = GraphDef::new().with_node(add("a").with_input("a", json!(2)));

  let plan = resolver().resolve(&def).unwrap();
  let node = plan.node("a").unwrap();
  assert_eq!(node.inputs["a"], 2);
  assert_eq!(node.inputs["b"], 0);
}

#[test]
fn test_edge_type_mismatch() {
  let def = GraphDef::new()
    .with_node(NodeDef::new("text", "string"))
    .with_node(add("sum"))
    .with_edge(EdgeDef::new(("text", "value"), ("sum", "a")));

  let err = resolver().resolve(&def).unwrap_err();
  assert!(matches!(
    err,
    ResolutionError::TypeMismatch { ref node_id, ref field, .. } if node_id == "sum" && field == "a"
  ));
}

#[test]
fn test_artifact_types_do_not_mix() {
  let def = GraphDef::new()
    .with_node(NodeDef::new("n", "integer"))
    .with_node(NodeDef::new("out", "render"))
    .with_edge(EdgeDef::new(("n", "value"), ("out", "latents")));

  assert!(matches!(
    resolver().resolve(&def),
    Err(ResolutionError::TypeMismatch { .. })
  ));
}

#[test]
fn test_integer_widens_to_float() {
  let def = GraphDef::new()
    .with_node(NodeDef::new("n", "integer"))
    .with_node(NodeDef::new("f", "float"))
    .with_edge(EdgeDef::new(("n", "value"), ("f", "value")));

  assert!(resolver().resolve(&def).is_ok());
}

#[test]
fn test_literal_type_mismatch() {
  let def = GraphDef::new().with_node(add("a").with_input("a", json!("five")));

  let err = resolver().resolve(&def).unwrap_err();
  assert!(matches!(err, ResolutionError::TypeMismatch { .. }));
}

#[test]
fn test_duplicate_binding() {
  let def = GraphDef::new()
    .with_node(add("x"))
    .with_node(add("y"))
    .with_node(add("z"))
    .with_edge(EdgeDef::new(("x", "value"), ("z", "a")))
    .with_edge(EdgeDef::new(("y", "value"), ("z", "a")));

  let err = resolver().resolve(&def).unwrap_err();
  assert_eq!(
    err,
    ResolutionError::DuplicateBinding {
      node_id: "z".to_string(),
      field: "a".to_string()
    }
  );
}

#[test]
fn test_edge_overrides_literal() {
  let def = GraphDef::new()
    .with_node(add("x"))
    .with_node(add("y").with_input("a", json!(100)))
    .with_edge(EdgeDef::new(("x", "value"), ("y", "a")));

  let plan = resolver().resolve(&def).unwrap();
  let y = plan.node("y").unwrap();
  assert!(!y.inputs.contains_key("a"));
  assert_eq!(y.bindings["a"].node_id, "x");
}

#[test]
fn test_unknown_kind_and_field() {
  let unknown_kind = GraphDef::new().with_node(NodeDef::new("a", "teleport"));
  assert_eq!(
    resolver().resolve(&unknown_kind).unwrap_err(),
    ResolutionError::UnknownKind {
      node_id: "a".to_string(),
      kind: "teleport".to_string()
    }
  );

  let unknown_literal = GraphDef::new().with_node(add("a").with_input("c", json!(1)));
  assert!(matches!(
    resolver().resolve(&unknown_literal),
    Err(ResolutionError::UnknownField { ref field, .. }) if field == "c"
  ));

  let unknown_output = GraphDef::new()
    .with_node(add("a"))
    .with_node(add("b"))
    .with_edge(EdgeDef::new(("a", "result"), ("b", "a")));
  assert!(matches!(
    resolver().resolve(&unknown_output),
    Err(ResolutionError::UnknownField { ref node_id, .. }) if node_id == "a"
  ));
}

fn iteration_graph() -> GraphDef {
  GraphDef::new()
    .with_node(NodeDef::new("range", "range").with_input("stop", json!(4)))
    .with_node(NodeDef::new("each", "iterate"))
    .with_node(NodeDef::new("double", "multiply").with_input("b", json!(2)))
    .with_node(NodeDef::new("gather", "collect"))
    .with_node(add("count"))
    .with_edge(EdgeDef::new(("range", "collection"), ("each", "collection")))
    .with_edge(EdgeDef::new(("each", "item"), ("double", "a")))
    .with_edge(EdgeDef::new(("double", "value"), ("gather", "item")))
    .with_edge(EdgeDef::new(("each", "total"), ("count", "a")))
}

#[test]
fn test_iteration_scopes() {
  let plan = resolver().resolve(&iteration_graph()).unwrap();

  assert_eq!(plan.steps.len(), 3);
  assert_eq!(plan.steps[0].node_id(), "range");
  match &plan.steps[1] {
    PlanStep::Iterate {
      node_id,
      after,
      body,
    } => {
      assert_eq!(node_id, "each");
      assert_eq!(after, &["range".to_string()]);
      let body_ids: Vec<&str> = body.iter().map(PlanStep::node_id).collect();
      assert_eq!(body_ids, vec!["double", "count"]);
    }
    other => panic!("expected iterate step, got {:?}", other),
  }
  assert_eq!(plan.steps[2].node_id(), "gather");
  assert_eq!(plan.steps[2].after(), &["each".to_string()]);

  assert_eq!(plan.node("double").unwrap().scope, vec!["each".to_string()]);
  assert_eq!(plan.node("each").unwrap().role, NodeRole::Iterate);
  assert_eq!(plan.node("each").unwrap().output_depth(), 1);
  assert_eq!(
    plan.node("gather").unwrap().role,
    NodeRole::Collect {
      closes: "each".to_string()
    }
  );
  assert!(plan.node("gather").unwrap().scope.is_empty());
}

#[test]
fn test_body_waits_for_outer_dependencies() {
  // `offset` is declared after the iterate node but feeds its body.
  let def = GraphDef::new()
    .with_node(NodeDef::new("range", "range"))
    .with_node(NodeDef::new("each", "iterate"))
    .with_node(add("shift"))
    .with_node(NodeDef::new("offset", "integer").with_input("value", json!(10)))
    .with_edge(EdgeDef::new(("range", "collection"), ("each", "collection")))
    .with_edge(EdgeDef::new(("each", "item"), ("shift", "a")))
    .with_edge(EdgeDef::new(("offset", "value"), ("shift", "b")));

  let plan = resolver().resolve(&def).unwrap();
  let top: Vec<&str> = plan.steps.iter().map(PlanStep::node_id).collect();
  assert_eq!(top, vec!["range", "offset", "each"]);
  assert_eq!(
    plan.steps[2].after(),
    &["range".to_string(), "offset".to_string()]
  );
}

#[test]
fn test_nested_iteration() {
  let def = GraphDef::new()
    .with_node(NodeDef::new("outer_range", "range").with_input("stop", json!(2)))
    .with_node(NodeDef::new("outer", "iterate"))
    .with_node(NodeDef::new("inner_range", "range"))
    .with_node(NodeDef::new("inner", "iterate"))
    .with_node(add("sum"))
    .with_node(NodeDef::new("gather", "collect"))
    .with_edge(EdgeDef::new(("outer_range", "collection"), ("outer", "collection")))
    .with_edge(EdgeDef::new(("outer", "item"), ("inner_range", "stop")))
    .with_edge(EdgeDef::new(("inner_range", "collection"), ("inner", "collection")))
    .with_edge(EdgeDef::new(("inner", "item"), ("sum", "a")))
    .with_edge(EdgeDef::new(("outer", "index"), ("sum", "b")))
    .with_edge(EdgeDef::new(("sum", "value"), ("gather", "item")));

  let plan = resolver().resolve(&def).unwrap();
  assert_eq!(
    plan.node("sum").unwrap().scope,
    vec!["outer".to_string(), "inner".to_string()]
  );
  assert_eq!(plan.node("gather").unwrap().scope, vec!["outer".to_string()]);
  assert_eq!(
    plan.order(),
    vec!["outer_range", "outer", "inner_range", "inner", "sum", "gather"]
  );
}

#[test]
fn test_collect_outside_iteration() {
  let def = GraphDef::new()
    .with_node(add("a"))
    .with_node(NodeDef::new("gather", "collect"))
    .with_edge(EdgeDef::new(("a", "value"), ("gather", "item")));

  assert_eq!(
    resolver().resolve(&def).unwrap_err(),
    ResolutionError::CollectOutsideIteration {
      node_id: "gather".to_string()
    }
  );
}

#[test]
fn test_unrelated_iterations_conflict() {
  let def = GraphDef::new()
    .with_node(NodeDef::new("r1", "range"))
    .with_node(NodeDef::new("r2", "range"))
    .with_node(NodeDef::new("i1", "iterate"))
    .with_node(NodeDef::new("i2", "iterate"))
    .with_node(add("zip"))
    .with_edge(EdgeDef::new(("r1", "collection"), ("i1", "collection")))
    .with_edge(EdgeDef::new(("r2", "collection"), ("i2", "collection")))
    .with_edge(EdgeDef::new(("i1", "item"), ("zip", "a")))
    .with_edge(EdgeDef::new(("i2", "item"), ("zip", "b")));

  assert_eq!(
    resolver().resolve(&def).unwrap_err(),
    ResolutionError::IterationConflict {
      node_id: "zip".to_string()
    }
  );
}

#[test]
fn test_resolution_is_deterministic() {
  let resolver = resolver();
  let def = iteration_graph();
  assert_eq!(resolver.resolve(&def).unwrap(), resolver.resolve(&def).unwrap());
}

#[test]
fn test_graph_json_round_trip_resolves_identically() {
  let def = iteration_graph();
  let json = serde_json::to_string(&def).unwrap();
  let back: GraphDef = serde_json::from_str(&json).unwrap();

  assert_eq!(back, def);
  assert_eq!(
    resolver().resolve(&back).unwrap(),
    resolver().resolve(&def).unwrap()
  );
}
