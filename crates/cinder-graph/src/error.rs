use thiserror::Error;

/// Reasons a graph is rejected before execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
  #[error("graph contains a cycle through: {}", nodes.join(", "))]
  CycleDetected { nodes: Vec<String> },

  #[error("required input '{field}' of node '{node_id}' is not bound")]
  UnboundInput { node_id: String, field: String },

  #[error("input '{field}' of node '{node_id}' expects {expected}, got {actual}")]
  TypeMismatch {
    node_id: String,
    field: String,
    expected: String,
    actual: String,
  },

  #[error("input '{field}' of node '{node_id}' is bound by more than one edge")]
  DuplicateBinding { node_id: String, field: String },

  #[error("duplicate node id: {node_id}")]
  DuplicateNode { node_id: String },

  #[error("edge references unknown node: {node_id}")]
  UnknownNode { node_id: String },

  #[error("node '{node_id}' has unknown kind '{kind}'")]
  UnknownKind { node_id: String, kind: String },

  #[error("node '{node_id}' has no slot named '{field}'")]
  UnknownField { node_id: String, field: String },

  #[error("node '{node_id}' mixes values from unrelated iterations")]
  IterationConflict { node_id: String },

  #[error("collect node '{node_id}' is not fed from inside an iteration")]
  CollectOutsideIteration { node_id: String },
}

impl ResolutionError {
  /// The node the error is about, when there is exactly one.
  pub fn node_id(&self) -> Option<&str> {
    match self {
      ResolutionError::CycleDetected { .. } => None,
      ResolutionError::UnboundInput { node_id, .. }
      | ResolutionError::TypeMismatch { node_id, .. }
      | ResolutionError::DuplicateBinding { node_id, .. }
      | ResolutionError::DuplicateNode { node_id }
      | ResolutionError::UnknownNode { node_id }
      | ResolutionError::UnknownKind { node_id, .. }
      | ResolutionError::UnknownField { node_id, .. }
      | ResolutionError::IterationConflict { node_id }
      | ResolutionError::CollectOutsideIteration { node_id } => Some(node_id),
    }
  }
}
