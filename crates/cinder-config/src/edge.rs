use serde::{Deserialize, Serialize};

/// One end of an edge: a node and one of its slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
  pub node_id: String,
  pub field: String,
}

impl FieldRef {
  pub fn new(node_id: impl Into<String>, field: impl Into<String>) -> Self {
    Self {
      node_id: node_id.into(),
      field: field.into(),
    }
  }
}

/// Connects a source node's output slot to a destination node's input slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDef {
  pub source: FieldRef,
  pub destination: FieldRef,
}

impl EdgeDef {
  /// Build an edge from `(node_id, field)` pairs.
  pub fn new(source: (&str, &str), destination: (&str, &str)) -> Self {
    Self {
      source: FieldRef::new(source.0, source.1),
      destination: FieldRef::new(destination.0, destination.1),
    }
  }
}
