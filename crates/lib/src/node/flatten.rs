//! Flatten nodes: drop every directory from entry paths.

use std::collections::BTreeMap;

use crate::node::NodeError;
use crate::path::RelPath;
use crate::store::EntryStore;
use crate::util::hash::Fingerprinter;

#[derive(Debug, Clone, Default)]
pub struct FlattenNode {
  pub dest_dir: Option<RelPath>,
}

impl FlattenNode {
  pub fn new(dest_dir: Option<RelPath>) -> Self {
    Self { dest_dir }
  }

  pub fn apply(&self, input: &EntryStore) -> Result<EntryStore, NodeError> {
    let mut output = EntryStore::new();
    let mut origins: BTreeMap<RelPath, &RelPath> = BTreeMap::new();

    for entry in input.iter() {
      let target = entry.path.flattened().under(self.dest_dir.as_ref());

      if let Some(first) = origins.get(&target) {
        return Err(NodeError::PathCollision {
          path: target,
          first: (*first).clone(),
          second: entry.path.clone(),
        });
      }
      origins.insert(target.clone(), &entry.path);
      output.insert(entry.relocated(target))?;
    }

    Ok(output)
  }

  pub(crate) fn fingerprint_params(&self, hasher: &mut Fingerprinter) {
    hasher.field("dest_dir", self.dest_dir.as_ref().map(RelPath::as_str).unwrap_or(""));
  }
}
