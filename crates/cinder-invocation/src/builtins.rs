//! Built-in invocation kinds.
//!
//! Primitives, integer math, ranges, record access and the two structural
//! kinds the resolver and processor treat specially: [`ITERATE_KIND`] and
//! [`COLLECT_KIND`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::InvocationFailure;
use crate::invocation::{Invocation, InvocationContext, require, require_i64};
use crate::registry::InvocationRegistry;
use crate::services::{ModelRef, RecordKind};
use crate::types::{InputSlot, Inputs, KindSchema, Outputs, SlotType};

/// Fans a collection out: downstream nodes run once per item.
pub const ITERATE_KIND: &str = "iterate";
/// Input slot of an iterate node holding the collection.
pub const ITERATE_COLLECTION: &str = "collection";
/// Per-item outputs of an iterate node.
pub const ITERATE_ITEM: &str = "item";
pub const ITERATE_INDEX: &str = "index";
pub const ITERATE_TOTAL: &str = "total";

/// Gathers per-item values back into a collection, ordered by item index.
pub const COLLECT_KIND: &str = "collect";
pub const COLLECT_ITEM: &str = "item";
pub const COLLECT_COLLECTION: &str = "collection";

fn single(field: &str, value: serde_json::Value) -> Outputs {
  Outputs::from([(field.to_string(), value)])
}

fn primitive(kind: &str, slot_type: SlotType, default: serde_json::Value) -> KindSchema {
  KindSchema::new(kind)
    .input(InputSlot::with_default("value", slot_type.clone(), default))
    .output("value", slot_type)
}

fn binary_math(kind: &str) -> KindSchema {
  KindSchema::new(kind)
    .input(InputSlot::with_default("a", SlotType::Integer, json!(0)))
    .input(InputSlot::with_default("b", SlotType::Integer, json!(0)))
    .output("value", SlotType::Integer)
}

fn passthrough(inputs: &Inputs) -> Result<Outputs, InvocationFailure> {
  Ok(single("value", require(inputs, "value")?.clone()))
}

fn checked(
  kind: &'static str,
  op: fn(i64, i64) -> Option<i64>,
) -> impl Fn(&Inputs) -> Result<Outputs, InvocationFailure> + Send + Sync + 'static {
  move |inputs: &Inputs| {
    let a = require_i64(inputs, "a")?;
    let b = require_i64(inputs, "b")?;
    let value = op(a, b).ok_or_else(|| {
      InvocationFailure::new("ArithmeticError", format!("{} overflowed or divided by zero", kind))
    })?;
    Ok(single("value", json!(value)))
  }
}

/// Register every built-in kind.
pub fn register_builtins(registry: &mut InvocationRegistry) {
  registry.register_fn(primitive("integer", SlotType::Integer, json!(0)), passthrough);
  registry.register_fn(primitive("float", SlotType::Float, json!(0.0)), passthrough);
  registry.register_fn(primitive("string", SlotType::String, json!("")), passthrough);
  registry.register_fn(primitive("boolean", SlotType::Boolean, json!(false)), passthrough);

  registry.register_fn(binary_math("add"), checked("add", i64::checked_add));
  registry.register_fn(binary_math("subtract"), checked("subtract", i64::checked_sub));
  registry.register_fn(binary_math("multiply"), checked("multiply", i64::checked_mul));
  registry.register_fn(binary_math("divide"), checked("divide", i64::checked_div));

  registry.register_fn(
    KindSchema::new("range")
      .input(InputSlot::with_default("start", SlotType::Integer, json!(0)))
      .input(InputSlot::with_default("stop", SlotType::Integer, json!(10)))
      .input(InputSlot::with_default("step", SlotType::Integer, json!(1)))
      .output("collection", SlotType::collection_of(SlotType::Integer)),
    range,
  );

  registry.register_fn(
    KindSchema::new(ITERATE_KIND)
      .input(InputSlot::required(
        ITERATE_COLLECTION,
        SlotType::collection_of(SlotType::Any),
      ))
      .output(ITERATE_ITEM, SlotType::Any)
      .output(ITERATE_INDEX, SlotType::Integer)
      .output(ITERATE_TOTAL, SlotType::Integer),
    iterate,
  );

  registry.register_fn(
    KindSchema::new(COLLECT_KIND)
      .input(InputSlot::required(COLLECT_ITEM, SlotType::Any))
      .output(COLLECT_COLLECTION, SlotType::collection_of(SlotType::Any)),
    |inputs: &Inputs| {
      let items = require(inputs, COLLECT_ITEM)?.clone();
      Ok(single(COLLECT_COLLECTION, items))
    },
  );

  registry.register(Arc::new(StoreRecord::new()));
  registry.register(Arc::new(LoadRecord::new()));
  registry.register(Arc::new(LoadModel::new()));
}

fn range(inputs: &Inputs) -> Result<Outputs, InvocationFailure> {
  let start = require_i64(inputs, "start")?;
  let stop = require_i64(inputs, "stop")?;
  let step = require_i64(inputs, "step")?;
  if step == 0 {
    return Err(InvocationFailure::invalid_input("range step must not be zero"));
  }

  let mut items = Vec::new();
  let mut current = start;
  while (step > 0 && current < stop) || (step < 0 && current > stop) {
    items.push(json!(current));
    current = match current.checked_add(step) {
      Some(next) => next,
      None => break,
    };
  }
  Ok(single("collection", json!(items)))
}

/// Validates the collection and reports its size. The processor expands the
/// per-item `item`/`index`/`total` outputs from this result.
fn iterate(inputs: &Inputs) -> Result<Outputs, InvocationFailure> {
  let collection = require(inputs, ITERATE_COLLECTION)?;
  let items = collection
    .as_array()
    .ok_or_else(|| InvocationFailure::invalid_input("iterate input is not a collection"))?;
  Ok(Outputs::from([
    (ITERATE_COLLECTION.to_string(), collection.clone()),
    (ITERATE_TOTAL.to_string(), json!(items.len())),
  ]))
}

fn record_kind(inputs: &Inputs) -> Result<RecordKind, InvocationFailure> {
  serde_json::from_value(require(inputs, "record_kind")?.clone())
    .map_err(|e| InvocationFailure::invalid_input(format!("invalid record_kind: {}", e)))
}

/// Writes its input to record storage. Has side effects, so never cached.
struct StoreRecord {
  schema: KindSchema,
}

impl StoreRecord {
  fn new() -> Self {
    Self {
      schema: KindSchema::new("store_record")
        .input(InputSlot::required("value", SlotType::Any))
        .input(InputSlot::with_default(
          "record_kind",
          SlotType::String,
          json!("value"),
        ))
        .output("id", SlotType::String)
        .uncacheable(),
    }
  }
}

#[async_trait]
impl Invocation for StoreRecord {
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(
    &self,
    inputs: Inputs,
    ctx: &InvocationContext,
  ) -> Result<Outputs, InvocationFailure> {
    let kind = record_kind(&inputs)?;
    let value = require(&inputs, "value")?.clone();
    let id = ctx.records().put(kind, value).await?;
    debug!(invocation_id = %ctx.invocation_id, record_kind = %kind, record_id = %id, "record_stored");
    Ok(single("id", json!(id)))
  }
}

/// Reads a record by id.
struct LoadRecord {
  schema: KindSchema,
}

impl LoadRecord {
  fn new() -> Self {
    Self {
      schema: KindSchema::new("load_record")
        .input(InputSlot::required("id", SlotType::String))
        .input(InputSlot::with_default(
          "record_kind",
          SlotType::String,
          json!("value"),
        ))
        .output("value", SlotType::Any)
        .uncacheable(),
    }
  }
}

#[async_trait]
impl Invocation for LoadRecord {
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(
    &self,
    inputs: Inputs,
    ctx: &InvocationContext,
  ) -> Result<Outputs, InvocationFailure> {
    let kind = record_kind(&inputs)?;
    let id = require(&inputs, "id")?
      .as_str()
      .ok_or_else(|| InvocationFailure::invalid_input("id is not a string"))?;
    let value = ctx.records().get(kind, id).await?;
    debug!(invocation_id = %ctx.invocation_id, record_kind = %kind, record_id = id, "record_loaded");
    Ok(single("value", value))
  }
}

/// Resolves a model reference through the model loader.
struct LoadModel {
  schema: KindSchema,
}

impl LoadModel {
  fn new() -> Self {
    Self {
      schema: KindSchema::new("load_model")
        .input(InputSlot::required("model", SlotType::Model))
        .output("model", SlotType::Model)
        .uncacheable(),
    }
  }
}

#[async_trait]
impl Invocation for LoadModel {
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(
    &self,
    inputs: Inputs,
    ctx: &InvocationContext,
  ) -> Result<Outputs, InvocationFailure> {
    let model: ModelRef = serde_json::from_value(require(&inputs, "model")?.clone())
      .map_err(|e| InvocationFailure::invalid_input(format!("invalid model reference: {}", e)))?;
    let handle = ctx.models().load(&model).await.map_err(|e| {
      debug!(invocation_id = %ctx.invocation_id, model = %model.key, error = %e, "model_load_failed");
      e
    })?;
    debug!(invocation_id = %ctx.invocation_id, model = %model.key, "model_loaded");
    let value = serde_json::to_value(handle)
      .map_err(|e| InvocationFailure::new("SerializationError", e.to_string()))?;
    Ok(single("model", value))
  }
}
