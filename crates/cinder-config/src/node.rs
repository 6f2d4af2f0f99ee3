use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A literal value bound to an input slot.
///
/// Values are plain JSON. Artifacts such as images, tensors and conditioning
/// travel as opaque record identifiers embedded in these values; the scheduler
/// never looks inside them.
pub type InputValue = serde_json::Value;

/// An invocation as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
  /// Identifier, unique within the owning graph.
  pub id: String,
  /// Name of the invocation kind in the registry (e.g. "add", "iterate").
  #[serde(alias = "type")]
  pub kind: String,
  /// Literal input values, keyed by slot name.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub inputs: BTreeMap<String, InputValue>,
  /// Set to false to bypass memoization for this node.
  #[serde(default = "default_use_cache")]
  pub use_cache: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
}

fn default_use_cache() -> bool {
  true
}

impl NodeDef {
  pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      kind: kind.into(),
      inputs: BTreeMap::new(),
      use_cache: true,
      timeout_ms: None,
    }
  }

  /// Bind a literal value to an input slot.
  pub fn with_input(mut self, field: impl Into<String>, value: InputValue) -> Self {
    self.inputs.insert(field.into(), value);
    self
  }

  pub fn with_use_cache(mut self, use_cache: bool) -> Self {
    self.use_cache = use_cache;
    self
  }

  pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = Some(timeout_ms);
    self
  }
}
