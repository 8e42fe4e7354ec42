//! Build graph nodes.
//!
//! A node is an immutable, pure transformation step: given the entry stores
//! of its inputs (in declared order) it produces one entry store. The kinds
//! are:
//!
//! - `Source`: leaf scanning a directory into a store
//! - `Filter`: select / re-root / relocate entries by glob
//! - `Substitute`: rewrite content with ordered text patterns
//! - `Flatten`: strip directories from every path
//! - `Compile`: delegate a batch of entries to a compiler collaborator
//! - `Merge`: union several inputs under an explicit conflict policy
//!
//! Every parameter that can change a node's output is folded into its
//! params fingerprint, which the engine combines with the fingerprints of
//! the inputs to decide whether a cached output is still valid.

pub mod compile;
pub mod filter;
pub mod flatten;
pub mod merge;
pub mod source;
pub mod substitute;

use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::RelPath;
use crate::placeholder::PlaceholderError;
use crate::store::{EntryStore, StoreError};
use crate::util::hash::{Fingerprint, Fingerprinter};

pub use compile::{
  CommandCompiler, CommandSpec, CompileConfig, CompileNode, CompileOutput, Compiler, CompilerFailure, Diagnostic,
  ModuleKind, ModuleResolution, Severity, Target,
};
pub use filter::{FilterNode, Selection};
pub use flatten::FlattenNode;
pub use merge::{MergeNode, MergePolicy};
pub use source::{FsScanner, MemoryScanner, ScanError, Scanner, SourceNode};
pub use substitute::{Matcher, PathFn, Pattern, Replacement, SubstituteNode, Template};

/// The name a node is declared under; unique within a graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for NodeId {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl From<String> for NodeId {
  fn from(id: String) -> Self {
    Self(id)
  }
}

/// Errors raised while evaluating a single node.
#[derive(Debug, Error)]
pub enum NodeError {
  /// Two distinct input paths were rewritten to the same output path.
  #[error("path collision at '{path}': '{first}' and '{second}' map to the same path")]
  PathCollision {
    path: RelPath,
    first: RelPath,
    second: RelPath,
  },

  /// A strict merge saw the same path in two inputs.
  #[error("merge conflict at '{path}': present in inputs '{first}' and '{second}'")]
  MergeConflict {
    path: RelPath,
    first: NodeId,
    second: NodeId,
  },

  /// Compilation reported errors and emission on error is disabled.
  #[error("compilation failed with {} error(s){}", error_count(.diagnostics), first_error(.diagnostics))]
  Compile { diagnostics: Vec<Diagnostic> },

  #[error("scan failed: {0}")]
  Scan(#[from] ScanError),

  #[error("compiler failed: {0}")]
  Compiler(#[from] CompilerFailure),

  #[error("failed to read content of '{path}': {source}")]
  Content {
    path: RelPath,
    #[source]
    source: io::Error,
  },

  #[error("placeholder error: {0}")]
  Placeholder(#[from] PlaceholderError),

  #[error("invalid output: {0}")]
  Store(#[from] StoreError),
}

fn error_count(diagnostics: &[Diagnostic]) -> usize {
  diagnostics.iter().filter(|d| d.is_error()).count()
}

fn first_error(diagnostics: &[Diagnostic]) -> String {
  diagnostics
    .iter()
    .find(|d| d.is_error())
    .map(|d| format!(": {d}"))
    .unwrap_or_default()
}

/// What a node evaluation produced.
#[derive(Debug, Default)]
pub struct NodeOutput {
  pub store: EntryStore,
  /// Non-fatal diagnostics surfaced as pass warnings.
  pub diagnostics: Vec<Diagnostic>,
}

impl From<EntryStore> for NodeOutput {
  fn from(store: EntryStore) -> Self {
    Self {
      store,
      diagnostics: Vec::new(),
    }
  }
}

/// The transformation a node performs.
#[derive(Debug)]
pub enum NodeKind {
  Source(SourceNode),
  Filter(FilterNode),
  Substitute(SubstituteNode),
  Flatten(FlattenNode),
  Compile(CompileNode),
  Merge(MergeNode),
}

/// How many inputs a node kind accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
  None,
  One,
  AtLeastOne,
}

impl fmt::Display for Arity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Arity::None => f.write_str("no inputs"),
      Arity::One => f.write_str("exactly one input"),
      Arity::AtLeastOne => f.write_str("at least one input"),
    }
  }
}

impl Arity {
  pub fn accepts(self, count: usize) -> bool {
    match self {
      Arity::None => count == 0,
      Arity::One => count == 1,
      Arity::AtLeastOne => count >= 1,
    }
  }
}

impl NodeKind {
  pub fn tag(&self) -> &'static str {
    match self {
      NodeKind::Source(_) => "source",
      NodeKind::Filter(_) => "filter",
      NodeKind::Substitute(_) => "substitute",
      NodeKind::Flatten(_) => "flatten",
      NodeKind::Compile(_) => "compile",
      NodeKind::Merge(_) => "merge",
    }
  }

  pub fn arity(&self) -> Arity {
    match self {
      NodeKind::Source(_) => Arity::None,
      NodeKind::Merge(_) => Arity::AtLeastOne,
      _ => Arity::One,
    }
  }

  /// Whether outputs of this kind are worth keeping across invocations.
  ///
  /// Only compilation is expensive enough to archive; every other kind is
  /// recomputed from its inputs in memory.
  pub fn is_persistent(&self) -> bool {
    matches!(self, NodeKind::Compile(_))
  }

  fn params_fingerprint(&self) -> Result<Fingerprint, serde_json::Error> {
    let mut hasher = Fingerprinter::new(self.tag());
    match self {
      NodeKind::Source(node) => node.fingerprint_params(&mut hasher),
      NodeKind::Filter(node) => node.fingerprint_params(&mut hasher),
      NodeKind::Substitute(node) => node.fingerprint_params(&mut hasher),
      NodeKind::Flatten(node) => node.fingerprint_params(&mut hasher),
      NodeKind::Compile(node) => node.fingerprint_params(&mut hasher)?,
      NodeKind::Merge(node) => node.fingerprint_params(&mut hasher),
    }
    Ok(hasher.finish())
  }
}

/// A node in a frozen build graph.
#[derive(Debug)]
pub struct Node {
  pub id: NodeId,
  pub kind: NodeKind,
  pub inputs: Vec<NodeId>,
  params_fingerprint: Fingerprint,
}

impl Node {
  pub(crate) fn new(id: NodeId, kind: NodeKind, inputs: Vec<NodeId>) -> Result<Self, serde_json::Error> {
    let params_fingerprint = kind.params_fingerprint()?;
    Ok(Self {
      id,
      kind,
      inputs,
      params_fingerprint,
    })
  }

  pub fn params_fingerprint(&self) -> &Fingerprint {
    &self.params_fingerprint
  }

  /// Combine the params fingerprint with the current input fingerprints.
  ///
  /// Source nodes pass the fingerprint of their fresh scan as their single
  /// "input".
  pub fn input_fingerprint(&self, inputs: &[&Fingerprint]) -> Fingerprint {
    let mut hasher = Fingerprinter::new("node-input");
    hasher.field("kind", self.kind.tag());
    hasher.fingerprint("params", &self.params_fingerprint);
    for (index, fingerprint) in inputs.iter().enumerate() {
      let id = self.inputs.get(index).map(NodeId::as_str).unwrap_or("scan");
      hasher.field("input", id);
      hasher.fingerprint("output", fingerprint);
    }
    hasher.finish()
  }

  /// Evaluate a node against its inputs' stores, in declared order.
  ///
  /// Sources ignore `inputs` and rescan.
  pub fn evaluate(&self, inputs: &[Arc<EntryStore>]) -> Result<NodeOutput, NodeError> {
    match &self.kind {
      NodeKind::Source(source) => Ok(source.scan()?.into()),
      NodeKind::Filter(filter) => filter.apply(&inputs[0]).map(NodeOutput::from),
      NodeKind::Substitute(substitute) => substitute.apply(&inputs[0]).map(NodeOutput::from),
      NodeKind::Flatten(flatten) => flatten.apply(&inputs[0]).map(NodeOutput::from),
      NodeKind::Compile(compile) => compile.apply(&inputs[0]),
      NodeKind::Merge(merge) => {
        let labelled: Vec<(&NodeId, &EntryStore)> = self.inputs.iter().zip(inputs.iter().map(|s| s.as_ref())).collect();
        merge.apply(&labelled).map(NodeOutput::from)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::{read, store};

  fn filter_node(dest: &str) -> Node {
    let filter = FilterNode::new().dest_dir(RelPath::parse_prefix(dest).unwrap());
    Node::new(NodeId::from("f"), NodeKind::Filter(filter), vec![NodeId::from("src")]).unwrap()
  }

  #[test]
  fn arity_rules() {
    assert!(Arity::None.accepts(0));
    assert!(!Arity::None.accepts(1));
    assert!(Arity::One.accepts(1));
    assert!(!Arity::One.accepts(2));
    assert!(Arity::AtLeastOne.accepts(3));
    assert!(!Arity::AtLeastOne.accepts(0));
  }

  #[test]
  fn params_fingerprint_tracks_params() {
    assert_eq!(filter_node("a").params_fingerprint(), filter_node("a").params_fingerprint());
    assert_ne!(filter_node("a").params_fingerprint(), filter_node("b").params_fingerprint());
  }

  #[test]
  fn input_fingerprint_tracks_inputs() {
    let node = filter_node("a");
    let one = store(&[("x.js", "1")]).fingerprint();
    let two = store(&[("x.js", "2")]).fingerprint();
    assert_eq!(node.input_fingerprint(&[&one]), node.input_fingerprint(&[&one]));
    assert_ne!(node.input_fingerprint(&[&one]), node.input_fingerprint(&[&two]));
  }

  #[test]
  fn evaluate_dispatches_to_kind() {
    let node = filter_node("out");
    let input = Arc::new(store(&[("x.js", "1")]));
    let output = node.evaluate(&[input]).unwrap();
    assert_eq!(read(&output.store, "out/x.js"), "1");
    assert!(output.diagnostics.is_empty());
  }

  #[test]
  fn evaluate_scans_sources() {
    let scanner = Arc::new(MemoryScanner::new());
    scanner.write("a.ts", "let a;").unwrap();
    let source = SourceNode::new("app", scanner.clone());
    let node = Node::new(NodeId::from("src"), NodeKind::Source(source), vec![]).unwrap();

    let output = node.evaluate(&[]).unwrap();
    assert_eq!(read(&output.store, "a.ts"), "let a;");

    let missing = SourceNode::new("/definitely/not/here", Arc::new(FsScanner::new()));
    let node = Node::new(NodeId::from("src"), NodeKind::Source(missing), vec![]).unwrap();
    assert!(matches!(node.evaluate(&[]), Err(NodeError::Scan(_))));
  }

  #[test]
  fn compile_error_message_names_first_error() {
    let err = NodeError::Compile {
      diagnostics: vec![
        Diagnostic::warning("unused"),
        Diagnostic::error("Cannot find name 'x'").at("a.ts", 3, 7).with_code("TS2304"),
      ],
    };
    assert_eq!(
      err.to_string(),
      "compilation failed with 1 error(s): a.ts(3,7): error TS2304: Cannot find name 'x'"
    );
  }
}
