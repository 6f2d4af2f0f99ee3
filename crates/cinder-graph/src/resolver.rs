use std::collections::BTreeMap;
use std::sync::Arc;

use cinder_config::{FieldRef, GraphDef};
use cinder_invocation::builtins::{COLLECT_KIND, ITERATE_KIND};
use cinder_invocation::{Inputs, InvocationRegistry, KindSchema};
use tracing::debug;

use crate::error::ResolutionError;
use crate::graph::{Graph, kahn};
use crate::plan::{ExecutionPlan, NodeRole, PlanStep, PlannedNode};

type Bindings = BTreeMap<String, FieldRef>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
  Invoke,
  Iterate,
  Collect,
}

/// Validates graphs against the kinds in a registry and plans their execution.
#[derive(Clone)]
pub struct Resolver {
  registry: Arc<InvocationRegistry>,
}

impl Resolver {
  pub fn new(registry: Arc<InvocationRegistry>) -> Self {
    Self { registry }
  }

  /// Validate `def` and produce its execution plan.
  ///
  /// This:
  /// 1. Checks node ids and edge endpoints
  /// 2. Orders nodes topologically, ties broken by declaration order
  /// 3. Checks kinds and binds every input slot to an edge, a literal or a default
  /// 4. Groups nodes downstream of iterate nodes into per-item scopes
  pub fn resolve(&self, def: &GraphDef) -> Result<ExecutionPlan, ResolutionError> {
    let graph = Graph::new(def)?;
    let order = graph.topological_order()?;
    let schemas = self.schemas(def)?;
    let roles: Vec<Role> = schemas.iter().copied().map(role_of).collect();

    let bindings = bind_edges(def, &graph, &schemas)?;
    let inputs = bind_literals(def, &schemas, &bindings)?;
    let (scopes, closes) = assign_scopes(&graph, &order, &bindings, &roles)?;
    let steps = build_level(&graph, &scopes, &roles, &[])?;

    let mut nodes = BTreeMap::new();
    for (index, (node, inputs)) in def.nodes.iter().zip(inputs).enumerate() {
      let role = match (roles[index], closes[index]) {
        (Role::Iterate, _) => NodeRole::Iterate,
        (Role::Collect, Some(closes)) => NodeRole::Collect {
          closes: graph.id(closes).to_string(),
        },
        _ => NodeRole::Invoke,
      };
      nodes.insert(
        node.id.clone(),
        PlannedNode {
          id: node.id.clone(),
          kind: node.kind.clone(),
          role,
          inputs,
          bindings: bindings[index].clone(),
          scope: scopes[index]
            .iter()
            .map(|&n| graph.id(n).to_string())
            .collect(),
          use_cache: node.use_cache,
          timeout_ms: node.timeout_ms,
        },
      );
    }

    debug!(nodes = nodes.len(), steps = steps.len(), "graph_resolved");
    Ok(ExecutionPlan { steps, nodes })
  }

  fn schemas<'a>(&'a self, def: &GraphDef) -> Result<Vec<&'a KindSchema>, ResolutionError> {
    def
      .nodes
      .iter()
      .map(|node| {
        self
          .registry
          .schema(&node.kind)
          .ok_or_else(|| ResolutionError::UnknownKind {
            node_id: node.id.clone(),
            kind: node.kind.clone(),
          })
      })
      .collect()
  }
}

fn role_of(schema: &KindSchema) -> Role {
  match schema.kind.as_str() {
    ITERATE_KIND => Role::Iterate,
    COLLECT_KIND => Role::Collect,
    _ => Role::Invoke,
  }
}

fn node_index(graph: &Graph, node_id: &str) -> Result<usize, ResolutionError> {
  graph
    .index_of(node_id)
    .ok_or_else(|| ResolutionError::UnknownNode {
      node_id: node_id.to_string(),
    })
}

/// Check every edge against the slot declarations of both endpoints.
fn bind_edges(
  def: &GraphDef,
  graph: &Graph,
  schemas: &[&KindSchema],
) -> Result<Vec<Bindings>, ResolutionError> {
  let mut bindings = vec![Bindings::new(); def.nodes.len()];

  for edge in &def.edges {
    let (source, destination) = (&edge.source, &edge.destination);
    let from = node_index(graph, &source.node_id)?;
    let to = node_index(graph, &destination.node_id)?;

    let output =
      schemas[from]
        .get_output(&source.field)
        .ok_or_else(|| ResolutionError::UnknownField {
          node_id: source.node_id.clone(),
          field: source.field.clone(),
        })?;
    let input =
      schemas[to]
        .get_input(&destination.field)
        .ok_or_else(|| ResolutionError::UnknownField {
          node_id: destination.node_id.clone(),
          field: destination.field.clone(),
        })?;

    if bindings[to]
      .insert(destination.field.clone(), source.clone())
      .is_some()
    {
      return Err(ResolutionError::DuplicateBinding {
        node_id: destination.node_id.clone(),
        field: destination.field.clone(),
      });
    }

    if !input.slot_type.accepts(&output.slot_type) {
      return Err(ResolutionError::TypeMismatch {
        node_id: destination.node_id.clone(),
        field: destination.field.clone(),
        expected: input.slot_type.to_string(),
        actual: format!(
          "{} from {}.{}",
          output.slot_type, source.node_id, source.field
        ),
      });
    }
  }

  Ok(bindings)
}

/// Fill every slot no edge binds from the node's literals or the slot default.
///
/// An edge always wins over a literal for the same slot.
fn bind_literals(
  def: &GraphDef,
  schemas: &[&KindSchema],
  bindings: &[Bindings],
) -> Result<Vec<Inputs>, ResolutionError> {
  let mut resolved = Vec::with_capacity(def.nodes.len());

  for (index, node) in def.nodes.iter().enumerate() {
    let schema = schemas[index];
    if let Some(field) = node.inputs.keys().find(|f| schema.get_input(f).is_none()) {
      return Err(ResolutionError::UnknownField {
        node_id: node.id.clone(),
        field: field.clone(),
      });
    }

    let mut inputs = Inputs::new();
    for slot in &schema.inputs {
      if bindings[index].contains_key(&slot.name) {
        continue;
      }

      if let Some(literal) = node.inputs.get(&slot.name) {
        if !slot.slot_type.matches_value(literal) {
          return Err(ResolutionError::TypeMismatch {
            node_id: node.id.clone(),
            field: slot.name.clone(),
            expected: slot.slot_type.to_string(),
            actual: format!("literal {}", literal),
          });
        }
        inputs.insert(slot.name.clone(), literal.clone());
      } else if let Some(default) = &slot.default {
        inputs.insert(slot.name.clone(), default.clone());
      } else {
        return Err(ResolutionError::UnboundInput {
          node_id: node.id.clone(),
          field: slot.name.clone(),
        });
      }
    }
    resolved.push(inputs);
  }

  Ok(resolved)
}

/// Work out the chain of iterate nodes enclosing each node.
///
/// A node joins the deepest scope among its inputs; all input scopes must lie
/// on one chain. Iterate nodes open a scope for their consumers, collect
/// nodes close the innermost scope of their `item` input. Also returns, for
/// each collect node, the iterate node it closes.
fn assign_scopes(
  graph: &Graph,
  order: &[usize],
  bindings: &[Bindings],
  roles: &[Role],
) -> Result<(Vec<Vec<usize>>, Vec<Option<usize>>), ResolutionError> {
  let mut scopes: Vec<Vec<usize>> = vec![Vec::new(); graph.len()];
  let mut closes = vec![None; graph.len()];

  for &node in order {
    let mut merged: Vec<usize> = Vec::new();
    for source in bindings[node].values() {
      let from = node_index(graph, &source.node_id)?;
      let mut chain = scopes[from].clone();
      if roles[from] == Role::Iterate {
        chain.push(from);
      }

      let nested = if chain.len() > merged.len() {
        chain.starts_with(&merged)
      } else {
        merged.starts_with(&chain)
      };
      if !nested {
        return Err(ResolutionError::IterationConflict {
          node_id: graph.id(node).to_string(),
        });
      }
      if chain.len() > merged.len() {
        merged = chain;
      }
    }

    if roles[node] == Role::Collect {
      let Some(closed) = merged.pop() else {
        return Err(ResolutionError::CollectOutsideIteration {
          node_id: graph.id(node).to_string(),
        });
      };
      closes[node] = Some(closed);
    }
    scopes[node] = merged;
  }

  Ok((scopes, closes))
}

/// Plan the steps of one scope, recursing into iterate bodies.
///
/// Dependencies are lifted to this level: a step waits for a sibling if
/// anything inside it consumes anything inside the sibling.
fn build_level(
  graph: &Graph,
  scopes: &[Vec<usize>],
  roles: &[Role],
  scope: &[usize],
) -> Result<Vec<PlanStep>, ResolutionError> {
  let depth = scope.len();
  let inside = |n: usize| scopes[n].starts_with(scope);
  let representative = |n: usize| {
    if scopes[n].len() == depth {
      n
    } else {
      scopes[n][depth]
    }
  };

  let units: Vec<usize> = (0..graph.len())
    .filter(|&n| scopes[n].as_slice() == scope)
    .collect();
  let mut position = vec![usize::MAX; graph.len()];
  for (pos, &unit) in units.iter().enumerate() {
    position[unit] = pos;
  }

  let mut deps: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
  for member in (0..graph.len()).filter(|&n| inside(n)) {
    let to = position[representative(member)];
    for &source in graph.upstream(member) {
      if !inside(source) {
        continue;
      }
      let from = position[representative(source)];
      if from != to && !deps[to].contains(&from) {
        deps[to].push(from);
      }
    }
  }

  let order = kahn(&deps).map_err(|remaining| ResolutionError::IterationConflict {
    node_id: remaining
      .first()
      .map(|&p| graph.id(units[p]).to_string())
      .unwrap_or_default(),
  })?;

  let mut steps = Vec::with_capacity(units.len());
  for pos in order {
    let unit = units[pos];
    let node_id = graph.id(unit).to_string();
    let mut after_positions = deps[pos].clone();
    after_positions.sort_unstable();
    let after = after_positions
      .into_iter()
      .map(|p| graph.id(units[p]).to_string())
      .collect();

    if roles[unit] == Role::Iterate {
      let mut inner = scope.to_vec();
      inner.push(unit);
      steps.push(PlanStep::Iterate {
        node_id,
        after,
        body: build_level(graph, scopes, roles, &inner)?,
      });
    } else {
      steps.push(PlanStep::Invoke { node_id, after });
    }
  }

  Ok(steps)
}
