//! Walks one session's execution plan.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use cinder_graph::{ExecutionPlan, NodeRole, PlanStep, PlannedNode, instance_id};
use cinder_invocation::builtins::{
  COLLECT_ITEM, ITERATE_COLLECTION, ITERATE_INDEX, ITERATE_ITEM, ITERATE_TOTAL,
};
use cinder_invocation::{Inputs, Outputs};
use cinder_invoker::{InvokeError, InvokeRequest, Invoker, SessionContext};
use cinder_queue::SessionResults;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::{Value, json};
use tracing::debug;

/// Execution state of one plan.
///
/// Outputs are keyed by instance id, so a node inside an iterate scope
/// reads the instance of each upstream node that shares its index path.
pub(crate) struct PlanRun<'a> {
  plan: &'a ExecutionPlan,
  invoker: &'a Invoker,
  session: &'a SessionContext,
  concurrency: usize,
  results: Mutex<SessionResults>,
  /// Item count of every iterate instance that has run.
  counts: Mutex<HashMap<String, usize>>,
}

impl<'a> PlanRun<'a> {
  pub(crate) fn new(
    plan: &'a ExecutionPlan,
    invoker: &'a Invoker,
    session: &'a SessionContext,
    concurrency: usize,
  ) -> Self {
    Self {
      plan,
      invoker,
      session,
      concurrency: concurrency.max(1),
      results: Mutex::new(SessionResults::new()),
      counts: Mutex::new(HashMap::new()),
    }
  }

  /// Run every step. Stops at the first failure or cancellation.
  pub(crate) async fn run(&self) -> Result<(), InvokeError> {
    self.run_steps(&self.plan.steps, Vec::new()).await
  }

  /// Outputs of every instance that finished, successful or not.
  pub(crate) fn into_results(self) -> SessionResults {
    self
      .results
      .into_inner()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Run sibling steps in ready waves.
  ///
  /// A step is ready once every step in its `after` list has finished. Each
  /// wave takes up to `concurrency` ready steps in plan order, so a
  /// concurrency of 1 runs the steps exactly in plan order.
  fn run_steps<'s>(
    &'s self,
    steps: &'s [PlanStep],
    path: Vec<usize>,
  ) -> BoxFuture<'s, Result<(), InvokeError>> {
    async move {
      let mut done: HashSet<&str> = HashSet::new();
      let mut remaining: Vec<&PlanStep> = steps.iter().collect();

      while let Some(first) = remaining.first() {
        if self.session.cancel.is_cancelled() {
          return Err(InvokeError::Canceled {
            invocation_id: instance_id(first.node_id(), &path),
          });
        }

        let ready: Vec<&PlanStep> = remaining
          .iter()
          .filter(|step| step.after().iter().all(|dep| done.contains(dep.as_str())))
          .take(self.concurrency)
          .copied()
          .collect();
        if ready.is_empty() {
          return Err(failure(
            instance_id(first.node_id(), &path),
            "Unschedulable",
            "no step is ready to run",
          ));
        }

        if ready.len() > 1 {
          debug!(
            session_id = %self.session.session_id,
            steps = ?ready.iter().map(|s| s.node_id()).collect::<Vec<_>>(),
            "running_wave"
          );
        }

        let outcomes = join_all(ready.iter().map(|step| self.run_step(step, &path))).await;
        for (step, outcome) in ready.into_iter().zip(outcomes) {
          outcome?;
          done.insert(step.node_id());
        }
        remaining.retain(|step| !done.contains(step.node_id()));
      }

      Ok(())
    }
    .boxed()
  }

  async fn run_step(&self, step: &PlanStep, path: &[usize]) -> Result<(), InvokeError> {
    let node = self.node(step.node_id(), path)?;

    match step {
      PlanStep::Invoke { .. } => {
        let inputs = match &node.role {
          NodeRole::Collect { closes } => self.collect_inputs(node, closes, path)?,
          _ => self.bind_inputs(node, path)?,
        };
        self.invoke(node, path, inputs).await?;
        Ok(())
      }
      PlanStep::Iterate { body, .. } => {
        let inputs = self.bind_inputs(node, path)?;
        let outputs = self.invoke(node, path, inputs).await?;
        let Some(Value::Array(items)) = outputs.get(ITERATE_COLLECTION) else {
          return Err(failure(
            instance_id(&node.id, path),
            "InvalidCollection",
            "iterate produced no collection",
          ));
        };

        let total = items.len();
        self.counts().insert(instance_id(&node.id, path), total);

        // Items run one after another, in index order.
        for (index, item) in items.iter().enumerate() {
          let mut item_path = path.to_vec();
          item_path.push(index);

          let item_outputs = Outputs::from([
            (ITERATE_ITEM.to_string(), item.clone()),
            (ITERATE_INDEX.to_string(), json!(index)),
            (ITERATE_TOTAL.to_string(), json!(total)),
          ]);
          self
            .results()
            .insert(instance_id(&node.id, &item_path), item_outputs);

          self.run_steps(body, item_path).await?;
        }
        Ok(())
      }
    }
  }

  async fn invoke(
    &self,
    node: &PlannedNode,
    path: &[usize],
    inputs: Inputs,
  ) -> Result<Outputs, InvokeError> {
    let invocation_id = instance_id(&node.id, path);
    let request = InvokeRequest {
      invocation_id: invocation_id.clone(),
      node_id: node.id.clone(),
      kind: node.kind.clone(),
      inputs,
      use_cache: node.use_cache,
      timeout_ms: node.timeout_ms,
    };

    let outputs = self.invoker.invoke(request, self.session).await?;
    self.results().insert(invocation_id, outputs.clone());
    Ok(outputs)
  }

  /// Literal inputs overlaid with the outputs each binding points at.
  fn bind_inputs(&self, node: &PlannedNode, path: &[usize]) -> Result<Inputs, InvokeError> {
    let mut inputs = node.inputs.clone();
    let results = self.results();

    for (field, source) in &node.bindings {
      if matches!(node.role, NodeRole::Collect { .. }) && field == COLLECT_ITEM {
        continue;
      }
      let depth = self.node(&source.node_id, path)?.output_depth();
      let key = instance_id(&source.node_id, &path[..depth.min(path.len())]);
      let value = output(&results, &key, &source.field)
        .ok_or_else(|| missing(node, path, &key, &source.field))?;
      inputs.insert(field.clone(), value);
    }

    Ok(inputs)
  }

  /// Bound inputs plus `item` gathered from every item of the closed scope.
  fn collect_inputs(
    &self,
    node: &PlannedNode,
    closes: &str,
    path: &[usize],
  ) -> Result<Inputs, InvokeError> {
    let mut inputs = self.bind_inputs(node, path)?;
    let scope = instance_id(closes, path);

    let source = node
      .bindings
      .get(COLLECT_ITEM)
      .ok_or_else(|| missing(node, path, &scope, COLLECT_ITEM))?;
    let count = self
      .counts()
      .get(&scope)
      .copied()
      .ok_or_else(|| missing(node, path, &scope, ITERATE_COLLECTION))?;
    let depth = self.node(&source.node_id, path)?.output_depth();

    let results = self.results();
    let mut items = Vec::with_capacity(count);
    for index in 0..count {
      let mut item_path = path.to_vec();
      item_path.push(index);
      let key = instance_id(&source.node_id, &item_path[..depth.min(item_path.len())]);
      let value = output(&results, &key, &source.field)
        .ok_or_else(|| missing(node, path, &key, &source.field))?;
      items.push(value);
    }

    inputs.insert(COLLECT_ITEM.to_string(), Value::Array(items));
    Ok(inputs)
  }

  fn node(&self, node_id: &str, path: &[usize]) -> Result<&'a PlannedNode, InvokeError> {
    self.plan.node(node_id).ok_or_else(|| {
      failure(
        instance_id(node_id, path),
        "UnknownNode",
        format!("node '{}' is not in the plan", node_id),
      )
    })
  }

  fn results(&self) -> MutexGuard<'_, SessionResults> {
    self.results.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
    self.counts.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

fn output(results: &SessionResults, key: &str, field: &str) -> Option<Value> {
  results.get(key)?.get(field).cloned()
}

fn missing(node: &PlannedNode, path: &[usize], key: &str, field: &str) -> InvokeError {
  failure(
    instance_id(&node.id, path),
    "MissingOutput",
    format!("'{}' produced no output '{}'", key, field),
  )
}

fn failure(invocation_id: String, error_type: &str, message: impl Into<String>) -> InvokeError {
  InvokeError::Failed {
    invocation_id,
    error_type: error_type.to_string(),
    message: message.into(),
  }
}
