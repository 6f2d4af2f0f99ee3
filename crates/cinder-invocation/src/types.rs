//! Slot types and kind schemas.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resolved input values for one invocation, keyed by slot name.
///
/// A `BTreeMap` keeps key order stable, which the fingerprint relies on.
pub type Inputs = BTreeMap<String, serde_json::Value>;

/// Output bundle of one invocation, keyed by slot name.
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// The declared type of an input or output slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
  Any,
  Integer,
  Float,
  String,
  Boolean,
  Image,
  Tensor,
  Latents,
  Conditioning,
  Model,
  Collection(Box<SlotType>),
}

impl SlotType {
  pub fn collection_of(inner: SlotType) -> Self {
    Self::Collection(Box::new(inner))
  }

  /// Whether a value produced by a `source` slot may flow into a slot of this type.
  pub fn accepts(&self, source: &SlotType) -> bool {
    match (source, self) {
      (SlotType::Any, _) | (_, SlotType::Any) => true,
      (SlotType::Integer, SlotType::Float) => true,
      (SlotType::Collection(from), SlotType::Collection(to)) => to.accepts(from),
      (from, to) => from == to,
    }
  }

  /// Whether a literal value is acceptable for a slot of this type.
  ///
  /// Artifact types (images, tensors, ...) are referenced by opaque record ids,
  /// so any string or object is accepted for them.
  pub fn matches_value(&self, value: &serde_json::Value) -> bool {
    match self {
      SlotType::Any => true,
      SlotType::Integer => value.is_i64() || value.is_u64(),
      SlotType::Float => value.is_number(),
      SlotType::String => value.is_string(),
      SlotType::Boolean => value.is_boolean(),
      SlotType::Image
      | SlotType::Tensor
      | SlotType::Latents
      | SlotType::Conditioning
      | SlotType::Model => value.is_string() || value.is_object(),
      SlotType::Collection(inner) => value
        .as_array()
        .is_some_and(|items| items.iter().all(|item| inner.matches_value(item))),
    }
  }
}

impl fmt::Display for SlotType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SlotType::Any => write!(f, "any"),
      SlotType::Integer => write!(f, "integer"),
      SlotType::Float => write!(f, "float"),
      SlotType::String => write!(f, "string"),
      SlotType::Boolean => write!(f, "boolean"),
      SlotType::Image => write!(f, "image"),
      SlotType::Tensor => write!(f, "tensor"),
      SlotType::Latents => write!(f, "latents"),
      SlotType::Conditioning => write!(f, "conditioning"),
      SlotType::Model => write!(f, "model"),
      SlotType::Collection(inner) => write!(f, "collection<{}>", inner),
    }
  }
}

/// A named input slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
  pub name: String,
  pub slot_type: SlotType,
  /// Used when neither an edge nor a literal binds the slot.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
}

impl InputSlot {
  /// A slot that must be bound by an edge or a literal.
  pub fn required(name: impl Into<String>, slot_type: SlotType) -> Self {
    Self {
      name: name.into(),
      slot_type,
      default: None,
    }
  }

  pub fn with_default(
    name: impl Into<String>,
    slot_type: SlotType,
    default: serde_json::Value,
  ) -> Self {
    Self {
      name: name.into(),
      slot_type,
      default: Some(default),
    }
  }

  pub fn is_required(&self) -> bool {
    self.default.is_none()
  }
}

/// A named output slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
  pub name: String,
  pub slot_type: SlotType,
}

/// The declared shape of an invocation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindSchema {
  pub kind: String,
  pub inputs: Vec<InputSlot>,
  pub outputs: Vec<OutputSlot>,
  /// Inputs left out of the fingerprint (e.g. labels that don't affect the result).
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub cache_exempt: Vec<String>,
  /// False for kinds with side effects or nondeterministic output.
  pub cacheable: bool,
}

impl KindSchema {
  pub fn new(kind: impl Into<String>) -> Self {
    Self {
      kind: kind.into(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      cache_exempt: Vec::new(),
      cacheable: true,
    }
  }

  pub fn input(mut self, slot: InputSlot) -> Self {
    self.inputs.push(slot);
    self
  }

  pub fn output(mut self, name: impl Into<String>, slot_type: SlotType) -> Self {
    self.outputs.push(OutputSlot {
      name: name.into(),
      slot_type,
    });
    self
  }

  pub fn cache_exempt(mut self, field: impl Into<String>) -> Self {
    self.cache_exempt.push(field.into());
    self
  }

  pub fn uncacheable(mut self) -> Self {
    self.cacheable = false;
    self
  }

  pub fn get_input(&self, name: &str) -> Option<&InputSlot> {
    self.inputs.iter().find(|s| s.name == name)
  }

  pub fn get_output(&self, name: &str) -> Option<&OutputSlot> {
    self.outputs.iter().find(|s| s.name == name)
  }
}
