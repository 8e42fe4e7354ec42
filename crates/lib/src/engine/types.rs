//! Types for pass evaluation.
//!
//! This module defines the configuration, cancellation token, error and
//! report types used by the [`Engine`](super::Engine).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::graph::GraphError;
use crate::node::{Diagnostic, NodeError, NodeId};
use crate::path::RelPath;
use crate::store::EntryStore;
use crate::util::hash::Fingerprint;

/// Errors that abort a whole pass.
///
/// A failing node does not abort the pass; it is reported in
/// [`PassReport::failed`] instead.
#[derive(Debug, Error)]
pub enum EngineError {
  /// The pass was cancelled; no cache update from it was kept.
  #[error("pass cancelled")]
  Cancelled,

  #[error("unknown node: {0}")]
  UnknownNode(NodeId),

  #[error(transparent)]
  Graph(#[from] GraphError),

  /// A node task panicked or could not be scheduled.
  #[error("node task failed: {0}")]
  Join(String),

  /// The requested node did not produce an output in this pass.
  #[error("node '{node}' produced no output: {reason}")]
  NoOutput { node: NodeId, reason: String },
}

/// Configuration for pass evaluation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Maximum number of nodes evaluated concurrently.
  pub parallelism: usize,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
    }
  }
}

/// Cooperative cancellation for a pass.
///
/// Checked before every wave and before every node; cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// A node's cached result.
#[derive(Debug, Clone)]
pub struct CachedOutput {
  pub input_fingerprint: Fingerprint,
  pub output_fingerprint: Fingerprint,
  pub store: Arc<EntryStore>,
  pub diagnostics: Vec<Diagnostic>,
}

/// The persisted form of a node's cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
  pub input_fingerprint: Fingerprint,
  pub output_fingerprint: Fingerprint,
  /// Path to content fingerprint, kept for persistent nodes only.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entries: Option<BTreeMap<RelPath, Fingerprint>>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub diagnostics: Vec<Diagnostic>,
}

/// A node record plus, for persistent nodes evaluated in this session, the
/// output whose blobs must be archived.
#[derive(Debug, Clone)]
pub struct ExportedNode {
  pub record: NodeRecord,
  pub output: Option<Arc<EntryStore>>,
}

/// Outputs of persistent nodes kept across engine instances.
pub trait OutputArchive: Send + Sync {
  /// Rebuild a node's output from its record, or `None` if any blob is gone.
  fn restore(&self, node: &NodeId, record: &NodeRecord) -> Option<EntryStore>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PassWarning {
  pub node: NodeId,
  pub diagnostic: Diagnostic,
}

#[derive(Debug, Serialize)]
pub struct NodeFailure {
  pub node: NodeId,
  #[serde(serialize_with = "error_message")]
  pub error: NodeError,
}

fn error_message<S: Serializer>(error: &NodeError, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.collect_str(error)
}

/// What happened to every node of a pass.
///
/// This doubles as the evaluation-count probe: a node appears in
/// `evaluated` only if its transformation actually ran.
#[derive(Debug, Default, Serialize)]
pub struct PassReport {
  /// Nodes recomputed in this pass.
  pub evaluated: Vec<NodeId>,
  /// Nodes whose cached output was reused.
  pub cached: Vec<NodeId>,
  /// Persistent nodes whose output was restored from the archive.
  pub restored: Vec<NodeId>,
  pub failed: Vec<NodeFailure>,
  /// Skipped node -> the failed dependency that caused it.
  pub skipped: BTreeMap<NodeId, NodeId>,
  pub warnings: Vec<PassWarning>,
}

impl PassReport {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn was_evaluated(&self, id: &NodeId) -> bool {
    self.evaluated.contains(id)
  }

  pub fn failure(&self, id: &NodeId) -> Option<&NodeError> {
    self.failed.iter().find(|f| &f.node == id).map(|f| &f.error)
  }

  /// Why a node has no output in this pass.
  pub fn blocked_reason(&self, id: &NodeId) -> String {
    match (self.failure(id), self.skipped.get(id)) {
      (Some(error), _) => error.to_string(),
      (None, Some(dep)) => format!("dependency '{dep}' failed"),
      (None, None) => "not evaluated".to_string(),
    }
  }

  /// Number of nodes the pass visited.
  pub fn total(&self) -> usize {
    self.evaluated.len() + self.cached.len() + self.restored.len() + self.failed.len() + self.skipped.len()
  }

  pub(crate) fn sort(&mut self) {
    self.evaluated.sort();
    self.cached.sort();
    self.restored.sort();
    self.failed.sort_by(|a, b| a.node.cmp(&b.node));
  }
}

/// The report of a pass plus the outputs of the requested nodes.
#[derive(Debug)]
pub struct PassResult {
  pub report: PassReport,
  pub(crate) outputs: BTreeMap<NodeId, Arc<EntryStore>>,
}

impl PassResult {
  /// Output of a requested node, if it succeeded.
  pub fn output(&self, id: &NodeId) -> Option<&Arc<EntryStore>> {
    self.outputs.get(id)
  }

  pub fn outputs(&self) -> impl Iterator<Item = (&NodeId, &Arc<EntryStore>)> {
    self.outputs.iter()
  }
}
