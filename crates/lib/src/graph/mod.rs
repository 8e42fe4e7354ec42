//! Build graph construction.
//!
//! A [`GraphBuilder`] collects node declarations whose inputs refer to other
//! nodes by id. [`GraphBuilder::build`] validates the declarations, rejects
//! cycles and freezes the nodes reachable from the requested roots into an
//! immutable [`BuildGraph`]. No evaluation ever happens on an invalid graph.

mod builder;
mod dag;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::glob::GlobError;
use crate::node::{Arity, Node, NodeId};
use crate::path::PathError;

pub use builder::GraphBuilder;
pub use dag::NodeDag;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("cycle detected: {}", format_cycle(.0))]
  Cycle(Vec<NodeId>),

  #[error("duplicate node id '{0}'")]
  DuplicateNode(NodeId),

  #[error("node '{node}' references unknown input '{input}'")]
  UnknownInput { node: NodeId, input: NodeId },

  #[error("unknown root node '{0}'")]
  UnknownRoot(NodeId),

  #[error("a build graph needs at least one root")]
  NoRoots,

  #[error("node '{node}' ({kind}) takes {expected}, got {actual}")]
  Arity {
    node: NodeId,
    kind: &'static str,
    expected: Arity,
    actual: usize,
  },

  #[error("invalid parameters for node '{node}': {message}")]
  InvalidParams { node: NodeId, message: String },

  #[error("invalid glob in node '{node}': {source}")]
  Glob {
    node: NodeId,
    #[source]
    source: GlobError,
  },

  #[error("invalid path in node '{node}': {source}")]
  Path {
    node: NodeId,
    #[source]
    source: PathError,
  },

  #[error("failed to fingerprint node '{node}': {source}")]
  Fingerprint {
    node: NodeId,
    #[source]
    source: serde_json::Error,
  },
}

fn format_cycle(path: &[NodeId]) -> String {
  path.iter().map(NodeId::as_str).collect::<Vec<_>>().join(" -> ")
}

/// A frozen, acyclic set of nodes reachable from the roots.
#[derive(Debug)]
pub struct BuildGraph {
  nodes: BTreeMap<NodeId, Arc<Node>>,
  dag: NodeDag,
  roots: Vec<NodeId>,
}

impl BuildGraph {
  pub fn node(&self, id: &NodeId) -> Option<&Arc<Node>> {
    self.nodes.get(id)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
    self.nodes.values()
  }

  pub fn roots(&self) -> &[NodeId] {
    &self.roots
  }

  pub fn dag(&self) -> &NodeDag {
    &self.dag
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Evaluation waves for the whole graph.
  pub fn waves(&self) -> Result<Vec<Vec<NodeId>>, GraphError> {
    self.dag.waves()
  }
}
