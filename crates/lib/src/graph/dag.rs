//! Dependency DAG over node ids.
//!
//! Edges point from an input to the node consuming it. The DAG provides the
//! topological order, Kahn-style parallel waves and ancestor closures used
//! by the engine to evaluate only what a request needs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::GraphError;
use crate::node::NodeId;

#[derive(Debug, Clone)]
pub struct NodeDag {
  graph: DiGraph<NodeId, ()>,
  indices: HashMap<NodeId, NodeIndex>,
}

impl NodeDag {
  /// Build the DAG from each node's declared inputs.
  ///
  /// Every input must itself be a key of `nodes`.
  ///
  /// # Errors
  ///
  /// Returns `GraphError::Cycle` with the offending cycle if the inputs are
  /// not acyclic.
  pub fn from_inputs(nodes: &BTreeMap<NodeId, Vec<NodeId>>) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut indices = HashMap::new();

    for id in nodes.keys() {
      let idx = graph.add_node(id.clone());
      indices.insert(id.clone(), idx);
    }

    for (id, inputs) in nodes {
      let dependent = indices[id];
      for input in inputs {
        if let Some(&dependency) = indices.get(input) {
          graph.add_edge(dependency, dependent, ());
        }
      }
    }

    let dag = Self { graph, indices };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    match toposort(&self.graph, None) {
      Ok(_) => Ok(()),
      Err(cycle) => Err(GraphError::Cycle(self.cycle_through(cycle.node_id()))),
    }
  }

  /// Find a cycle passing through `start`, as a list of ids from `start`
  /// back to itself.
  fn cycle_through(&self, start: NodeIndex) -> Vec<NodeId> {
    let mut stack = vec![(start, vec![start])];
    let mut seen = BTreeSet::new();
    while let Some((idx, path)) = stack.pop() {
      for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        if next == start {
          let mut cycle: Vec<NodeId> = path.iter().map(|&i| self.graph[i].clone()).collect();
          cycle.push(self.graph[start].clone());
          return cycle;
        }
        if seen.insert(next) {
          let mut extended = path.clone();
          extended.push(next);
          stack.push((next, extended));
        }
      }
    }
    vec![self.graph[start].clone()]
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn contains(&self, id: &NodeId) -> bool {
    self.indices.contains_key(id)
  }

  /// Node ids with every input before its consumers.
  pub fn topological(&self) -> Result<Vec<NodeId>, GraphError> {
    let sorted = toposort(&self.graph, None).map_err(|c| GraphError::Cycle(self.cycle_through(c.node_id())))?;
    Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
  }

  /// All nodes organized into parallel evaluation waves.
  pub fn waves(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
    let all: BTreeSet<NodeId> = self.indices.keys().cloned().collect();
    self.waves_within(&all)
  }

  /// The nodes of `subset` organized into parallel evaluation waves.
  ///
  /// Each wave contains nodes whose inputs all lie in previous waves. Waves
  /// are sorted by id so evaluation order is deterministic. `subset` must be
  /// closed under inputs (see [`NodeDag::ancestors`]).
  pub fn waves_within(&self, subset: &BTreeSet<NodeId>) -> Result<Vec<Vec<NodeId>>, GraphError> {
    let members: Vec<NodeIndex> = subset.iter().filter_map(|id| self.indices.get(id).copied()).collect();
    let mut in_degree: HashMap<NodeIndex, usize> = members
      .iter()
      .map(|&idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut remaining: BTreeSet<NodeIndex> = members.into_iter().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&idx| in_degree[idx] == 0).copied().collect();
      if ready.is_empty() {
        let stuck = remaining.iter().next().copied().unwrap_or_else(|| NodeIndex::new(0));
        return Err(GraphError::Cycle(self.cycle_through(stuck)));
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(degree) = in_degree.get_mut(&dependent) {
            *degree = degree.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<NodeId> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }

  /// Direct inputs of a node (deduplicated, sorted).
  pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct consumers of a node (deduplicated, sorted).
  pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<NodeId> {
    let Some(&idx) = self.indices.get(id) else {
      return Vec::new();
    };
    let set: BTreeSet<NodeId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    set.into_iter().collect()
  }

  /// The targets plus everything they transitively depend on.
  pub fn ancestors<'a>(&self, targets: impl IntoIterator<Item = &'a NodeId>) -> BTreeSet<NodeId> {
    let mut closure = BTreeSet::new();
    let mut stack: Vec<NodeIndex> = targets.into_iter().filter_map(|id| self.indices.get(id).copied()).collect();
    while let Some(idx) = stack.pop() {
      if closure.insert(self.graph[idx].clone()) {
        stack.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
      }
    }
    closure
  }
}
