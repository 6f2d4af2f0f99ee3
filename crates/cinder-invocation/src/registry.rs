//! Kind registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtins;
use crate::error::InvocationFailure;
use crate::invocation::{FnInvocation, Invocation};
use crate::types::{Inputs, KindSchema, Outputs};

/// Maps kind names to invocation bodies.
///
/// The registry is built once at startup and shared read-only between the
/// resolver (which only needs schemas) and the invoker (which needs bodies).
#[derive(Clone, Default)]
pub struct InvocationRegistry {
  kinds: HashMap<String, Arc<dyn Invocation>>,
}

impl InvocationRegistry {
  /// An empty registry.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry preloaded with the built-in kinds.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    builtins::register_builtins(&mut registry);
    registry
  }

  /// Register a kind under its schema name, returning any body it replaced.
  pub fn register(&mut self, invocation: Arc<dyn Invocation>) -> Option<Arc<dyn Invocation>> {
    let kind = invocation.schema().kind.clone();
    self.kinds.insert(kind, invocation)
  }

  /// Register a pure function as a kind.
  pub fn register_fn<F>(&mut self, schema: KindSchema, func: F) -> Option<Arc<dyn Invocation>>
  where
    F: Fn(&Inputs) -> Result<Outputs, InvocationFailure> + Send + Sync + 'static,
  {
    self.register(Arc::new(FnInvocation::new(schema, func)))
  }

  pub fn get(&self, kind: &str) -> Option<Arc<dyn Invocation>> {
    self.kinds.get(kind).cloned()
  }

  pub fn schema(&self, kind: &str) -> Option<&KindSchema> {
    self.kinds.get(kind).map(|i| i.schema())
  }

  /// Registered kind names, sorted.
  pub fn kinds(&self) -> Vec<&str> {
    let mut kinds: Vec<&str> = self.kinds.keys().map(|k| k.as_str()).collect();
    kinds.sort_unstable();
    kinds
  }
}
