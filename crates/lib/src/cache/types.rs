use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::engine::NodeRecord;
use crate::node::NodeId;
use crate::path::RelPath;
use crate::util::hash::Fingerprint;

/// Current version of the cache state format.
pub const CACHE_VERSION: u32 = 1;

/// Everything persisted between invocations, stored as `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheState {
  pub version: u32,
  /// Memo records, keyed by node id.
  #[serde(default)]
  pub nodes: BTreeMap<NodeId, NodeRecord>,
  /// Materialization records, keyed by destination directory.
  #[serde(default)]
  pub outputs: BTreeMap<String, BTreeMap<RelPath, Fingerprint>>,
}

impl Default for CacheState {
  fn default() -> Self {
    Self {
      version: CACHE_VERSION,
      nodes: BTreeMap::new(),
      outputs: BTreeMap::new(),
    }
  }
}

impl CacheState {
  /// Object fingerprints still referenced by a node record.
  pub fn live_objects(&self) -> HashSet<&str> {
    self
      .nodes
      .values()
      .filter_map(|record| record.entries.as_ref())
      .flat_map(|entries| entries.values())
      .map(|fingerprint| fingerprint.0.as_str())
      .collect()
  }
}
