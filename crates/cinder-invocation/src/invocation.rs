//! The invocation body trait and the context handed to every call.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::InvocationFailure;
use crate::services::{ModelLoader, RecordStore, Services};
use crate::types::{Inputs, KindSchema, Outputs};

/// The body of an invocation kind.
///
/// Bodies receive fully resolved inputs and must not assume anything about
/// where they came from (edge, literal or default). Long-running bodies should
/// check [`InvocationContext::is_canceled`] or await
/// [`InvocationContext::cancelled`] to stop early.
#[async_trait]
pub trait Invocation: Send + Sync {
  fn schema(&self) -> &KindSchema;

  async fn invoke(
    &self,
    inputs: Inputs,
    ctx: &InvocationContext,
  ) -> Result<Outputs, InvocationFailure>;
}

/// Per-call context: who is running, the cancellation token, and services.
#[derive(Clone)]
pub struct InvocationContext {
  pub session_id: String,
  pub queue_id: String,
  /// Instance id of the running invocation (`node` or `node[i]` inside iterations).
  pub invocation_id: String,
  pub cancel: CancellationToken,
  services: Services,
}

impl InvocationContext {
  pub fn new(
    session_id: impl Into<String>,
    queue_id: impl Into<String>,
    invocation_id: impl Into<String>,
    cancel: CancellationToken,
    services: Services,
  ) -> Self {
    Self {
      session_id: session_id.into(),
      queue_id: queue_id.into(),
      invocation_id: invocation_id.into(),
      cancel,
      services,
    }
  }

  pub fn is_canceled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves once the owning session is canceled.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await
  }

  pub fn services(&self) -> &Services {
    &self.services
  }

  pub fn records(&self) -> &dyn RecordStore {
    self.services.records.as_ref()
  }

  pub fn models(&self) -> &dyn ModelLoader {
    self.services.models.as_ref()
  }
}

/// Adapts a pure function `(inputs) -> outputs | failure` into an [`Invocation`].
pub struct FnInvocation<F> {
  schema: KindSchema,
  func: F,
}

impl<F> FnInvocation<F>
where
  F: Fn(&Inputs) -> Result<Outputs, InvocationFailure> + Send + Sync,
{
  pub fn new(schema: KindSchema, func: F) -> Self {
    Self { schema, func }
  }
}

#[async_trait]
impl<F> Invocation for FnInvocation<F>
where
  F: Fn(&Inputs) -> Result<Outputs, InvocationFailure> + Send + Sync,
{
  fn schema(&self) -> &KindSchema {
    &self.schema
  }

  async fn invoke(
    &self,
    inputs: Inputs,
    _ctx: &InvocationContext,
  ) -> Result<Outputs, InvocationFailure> {
    (self.func)(&inputs)
  }
}

/// Fetch a resolved input, failing with `ValueError` if absent.
pub fn require<'a>(
  inputs: &'a Inputs,
  field: &str,
) -> Result<&'a serde_json::Value, InvocationFailure> {
  inputs
    .get(field)
    .ok_or_else(|| InvocationFailure::invalid_input(format!("missing input '{}'", field)))
}

/// Fetch a resolved integer input.
pub fn require_i64(inputs: &Inputs, field: &str) -> Result<i64, InvocationFailure> {
  require(inputs, field)?.as_i64().ok_or_else(|| {
    InvocationFailure::invalid_input(format!("input '{}' is not an integer", field))
  })
}
