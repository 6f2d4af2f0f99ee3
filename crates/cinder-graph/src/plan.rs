use std::collections::BTreeMap;

use cinder_config::FieldRef;
use cinder_invocation::Inputs;
use serde::{Deserialize, Serialize};

/// Id of one execution of a node.
///
/// Top-level nodes run once and use their node id. Nodes inside iterate
/// scopes run once per item and carry the item index path: `double[2]`, or
/// `inner[1,0]` for nested scopes.
pub fn instance_id(node_id: &str, path: &[usize]) -> String {
  if path.is_empty() {
    return node_id.to_string();
  }
  let indices: Vec<String> = path.iter().map(usize::to_string).collect();
  format!("{}[{}]", node_id, indices.join(","))
}

/// How the processor treats a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum NodeRole {
  /// Runs once per instance with its bound inputs.
  Invoke,
  /// Opens a scope: its per-item outputs drive the steps in its body.
  Iterate,
  /// Gathers its `item` input across every item of the scope it closes.
  Collect { closes: String },
}

/// A node with its inputs resolved to literals and edge bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedNode {
  pub id: String,
  pub kind: String,
  pub role: NodeRole,
  /// Literal inputs plus defaults for every slot no edge binds.
  pub inputs: Inputs,
  /// Input slot -> the output it reads.
  pub bindings: BTreeMap<String, FieldRef>,
  /// Enclosing iterate nodes, outermost first.
  pub scope: Vec<String>,
  pub use_cache: bool,
  pub timeout_ms: Option<u64>,
}

impl PlannedNode {
  /// How many index path entries address this node's outputs.
  ///
  /// An iterate node publishes its per-item outputs one level below the
  /// scope it lives in.
  pub fn output_depth(&self) -> usize {
    match self.role {
      NodeRole::Iterate => self.scope.len() + 1,
      _ => self.scope.len(),
    }
  }
}

/// One unit of scheduling within a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
  Invoke {
    node_id: String,
    /// Sibling steps that must finish first.
    after: Vec<String>,
  },
  Iterate {
    node_id: String,
    after: Vec<String>,
    /// Steps run once per item of the iterate node's collection.
    body: Vec<PlanStep>,
  },
}

impl PlanStep {
  pub fn node_id(&self) -> &str {
    match self {
      PlanStep::Invoke { node_id, .. } | PlanStep::Iterate { node_id, .. } => node_id,
    }
  }

  pub fn after(&self) -> &[String] {
    match self {
      PlanStep::Invoke { after, .. } | PlanStep::Iterate { after, .. } => after,
    }
  }

  fn flatten_into(&self, out: &mut Vec<String>) {
    out.push(self.node_id().to_string());
    if let PlanStep::Iterate { body, .. } = self {
      for step in body {
        step.flatten_into(out);
      }
    }
  }
}

/// Result of resolving a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
  /// Top-level steps in execution order.
  pub steps: Vec<PlanStep>,
  pub nodes: BTreeMap<String, PlannedNode>,
}

impl ExecutionPlan {
  /// Every node id in the order a sequential run would first reach it.
  pub fn order(&self) -> Vec<String> {
    let mut out = Vec::with_capacity(self.nodes.len());
    for step in &self.steps {
      step.flatten_into(&mut out);
    }
    out
  }

  pub fn node(&self, node_id: &str) -> Option<&PlannedNode> {
    self.nodes.get(node_id)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}
