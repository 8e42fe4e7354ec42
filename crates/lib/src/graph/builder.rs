use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{BuildGraph, GraphError, NodeDag};
use crate::node::{
  CompileNode, FilterNode, FlattenNode, MergeNode, MergePolicy, Node, NodeId, NodeKind, SourceNode, SubstituteNode,
};
use crate::path::RelPath;

struct Declaration {
  kind: NodeKind,
  inputs: Vec<NodeId>,
}

/// Collects node declarations and freezes them into a [`BuildGraph`].
///
/// Inputs are referenced by id and may be declared in any order; they are
/// resolved (and cycles detected) in [`GraphBuilder::build`].
#[derive(Default)]
pub struct GraphBuilder {
  nodes: BTreeMap<NodeId, Declaration>,
}

impl GraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare a node.
  ///
  /// # Errors
  ///
  /// Fails if the id is taken or the number of inputs does not fit the kind.
  pub fn add(&mut self, id: impl Into<NodeId>, kind: NodeKind, inputs: Vec<NodeId>) -> Result<NodeId, GraphError> {
    let id = id.into();
    if self.nodes.contains_key(&id) {
      return Err(GraphError::DuplicateNode(id));
    }

    let arity = kind.arity();
    if !arity.accepts(inputs.len()) {
      return Err(GraphError::Arity {
        node: id,
        kind: kind.tag(),
        expected: arity,
        actual: inputs.len(),
      });
    }

    self.nodes.insert(id.clone(), Declaration { kind, inputs });
    Ok(id)
  }

  pub fn source(&mut self, id: impl Into<NodeId>, source: SourceNode) -> Result<NodeId, GraphError> {
    self.add(id, NodeKind::Source(source), Vec::new())
  }

  pub fn filter(&mut self, id: impl Into<NodeId>, input: &NodeId, filter: FilterNode) -> Result<NodeId, GraphError> {
    self.add(id, NodeKind::Filter(filter), vec![input.clone()])
  }

  /// A filter that only moves every entry under `dest_dir`.
  pub fn relocate(&mut self, id: impl Into<NodeId>, input: &NodeId, dest_dir: RelPath) -> Result<NodeId, GraphError> {
    self.filter(id, input, FilterNode::relocate(dest_dir))
  }

  pub fn substitute(
    &mut self,
    id: impl Into<NodeId>,
    input: &NodeId,
    substitute: SubstituteNode,
  ) -> Result<NodeId, GraphError> {
    self.add(id, NodeKind::Substitute(substitute), vec![input.clone()])
  }

  pub fn flatten(&mut self, id: impl Into<NodeId>, input: &NodeId, flatten: FlattenNode) -> Result<NodeId, GraphError> {
    self.add(id, NodeKind::Flatten(flatten), vec![input.clone()])
  }

  pub fn compile(&mut self, id: impl Into<NodeId>, input: &NodeId, compile: CompileNode) -> Result<NodeId, GraphError> {
    self.add(id, NodeKind::Compile(compile), vec![input.clone()])
  }

  pub fn merge(&mut self, id: impl Into<NodeId>, inputs: &[NodeId], policy: MergePolicy) -> Result<NodeId, GraphError> {
    self.add(id, NodeKind::Merge(MergeNode::new(policy)), inputs.to_vec())
  }

  /// Validate the declarations and freeze the part reachable from `roots`.
  ///
  /// # Errors
  ///
  /// - `NoRoots` / `UnknownRoot` for bad roots
  /// - `UnknownInput` for a reference to an undeclared node
  /// - `Cycle` if any declared nodes form a cycle
  pub fn build<I, R>(self, roots: I) -> Result<BuildGraph, GraphError>
  where
    I: IntoIterator<Item = R>,
    R: Into<NodeId>,
  {
    let roots: Vec<NodeId> = roots.into_iter().map(Into::into).collect();
    if roots.is_empty() {
      return Err(GraphError::NoRoots);
    }
    for root in &roots {
      if !self.nodes.contains_key(root) {
        return Err(GraphError::UnknownRoot(root.clone()));
      }
    }

    for (id, declaration) in &self.nodes {
      for input in &declaration.inputs {
        if !self.nodes.contains_key(input) {
          return Err(GraphError::UnknownInput {
            node: id.clone(),
            input: input.clone(),
          });
        }
      }
    }

    let all_inputs: BTreeMap<NodeId, Vec<NodeId>> =
      self.nodes.iter().map(|(id, d)| (id.clone(), d.inputs.clone())).collect();
    let full = NodeDag::from_inputs(&all_inputs)?;
    let reachable = full.ancestors(&roots);

    let mut nodes = BTreeMap::new();
    let mut inputs = BTreeMap::new();
    for (id, declaration) in self.nodes {
      if !reachable.contains(&id) {
        debug!(node = %id, "dropping node unreachable from roots");
        continue;
      }
      inputs.insert(id.clone(), declaration.inputs.clone());
      let node = Node::new(id.clone(), declaration.kind, declaration.inputs)
        .map_err(|source| GraphError::Fingerprint { node: id.clone(), source })?;
      nodes.insert(id, Arc::new(node));
    }

    let dag = NodeDag::from_inputs(&inputs)?;
    debug!(nodes = nodes.len(), roots = roots.len(), "build graph frozen");
    Ok(BuildGraph { nodes, dag, roots })
  }
}
