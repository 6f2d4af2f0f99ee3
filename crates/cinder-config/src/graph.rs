use serde::{Deserialize, Serialize};

use crate::edge::EdgeDef;
use crate::node::NodeDef;

/// A graph definition: the unit a client submits as a session.
///
/// Node order is significant; the resolver breaks topological ties by
/// declaration order so identical definitions always produce identical plans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
  #[serde(default)]
  pub nodes: Vec<NodeDef>,
  #[serde(default)]
  pub edges: Vec<EdgeDef>,
}

impl GraphDef {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_node(mut self, node: NodeDef) -> Self {
    self.nodes.push(node);
    self
  }

  pub fn with_edge(mut self, edge: EdgeDef) -> Self {
    self.edges.push(edge);
    self
  }

  /// Get a node by ID.
  pub fn get_node(&self, node_id: &str) -> Option<&NodeDef> {
    self.nodes.iter().find(|n| n.id == node_id)
  }
}
