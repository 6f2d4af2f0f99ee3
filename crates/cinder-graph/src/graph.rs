use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use cinder_config::GraphDef;

use crate::error::ResolutionError;

/// Node adjacency for traversal and ordering.
///
/// Nodes are addressed by their declaration index. Parallel edges between the
/// same pair of nodes collapse into one dependency.
#[derive(Debug, Clone)]
pub struct Graph {
  ids: Vec<String>,
  index: HashMap<String, usize>,
  /// node -> nodes that consume its outputs
  downstream: Vec<Vec<usize>>,
  /// node -> nodes it consumes outputs from
  upstream: Vec<Vec<usize>>,
}

impl Graph {
  /// Build the adjacency of a graph definition.
  ///
  /// Fails on duplicate node ids and on edges that name a missing node.
  pub fn new(def: &GraphDef) -> Result<Self, ResolutionError> {
    let mut ids = Vec::with_capacity(def.nodes.len());
    let mut index = HashMap::with_capacity(def.nodes.len());
    for node in &def.nodes {
      if index.insert(node.id.clone(), ids.len()).is_some() {
        return Err(ResolutionError::DuplicateNode {
          node_id: node.id.clone(),
        });
      }
      ids.push(node.id.clone());
    }

    let mut downstream = vec![Vec::new(); ids.len()];
    let mut upstream = vec![Vec::new(); ids.len()];
    for edge in &def.edges {
      let lookup = |node_id: &str| {
        index
          .get(node_id)
          .copied()
          .ok_or_else(|| ResolutionError::UnknownNode {
            node_id: node_id.to_string(),
          })
      };
      let from = lookup(&edge.source.node_id)?;
      let to = lookup(&edge.destination.node_id)?;

      if !downstream[from].contains(&to) {
        downstream[from].push(to);
        upstream[to].push(from);
      }
    }

    Ok(Self {
      ids,
      index,
      downstream,
      upstream,
    })
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn id(&self, node: usize) -> &str {
    &self.ids[node]
  }

  pub fn index_of(&self, node_id: &str) -> Option<usize> {
    self.index.get(node_id).copied()
  }

  pub fn downstream(&self, node: usize) -> &[usize] {
    &self.downstream[node]
  }

  pub fn upstream(&self, node: usize) -> &[usize] {
    &self.upstream[node]
  }

  /// Nodes with no incoming edges, in declaration order.
  pub fn entry_points(&self) -> Vec<usize> {
    (0..self.len())
      .filter(|&n| self.upstream[n].is_empty())
      .collect()
  }

  /// Kahn's algorithm, ties broken by declaration order.
  pub fn topological_order(&self) -> Result<Vec<usize>, ResolutionError> {
    kahn(&self.upstream).map_err(|remaining| ResolutionError::CycleDetected {
      nodes: remaining.into_iter().map(|n| self.ids[n].clone()).collect(),
    })
  }
}

/// Order `0..deps.len()` so every item follows the items it depends on.
///
/// Among ready items the lowest index goes first. On a cycle, returns the
/// items that could not be ordered, ascending.
pub(crate) fn kahn(deps: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
  let count = deps.len();
  let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
  let mut dependents = vec![Vec::new(); count];
  for (item, item_deps) in deps.iter().enumerate() {
    for &dep in item_deps {
      dependents[dep].push(item);
    }
  }

  let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
    .filter(|&i| in_degree[i] == 0)
    .map(Reverse)
    .collect();
  let mut order = Vec::with_capacity(count);

  while let Some(Reverse(item)) = ready.pop() {
    order.push(item);
    for &next in &dependents[item] {
      in_degree[next] -= 1;
      if in_degree[next] == 0 {
        ready.push(Reverse(next));
      }
    }
  }

  if order.len() == count {
    Ok(order)
  } else {
    Err((0..count).filter(|&i| in_degree[i] > 0).collect())
  }
}
