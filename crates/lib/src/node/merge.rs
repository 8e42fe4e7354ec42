//! Merge nodes: union of several inputs under an explicit conflict policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::node::{NodeError, NodeId};
use crate::path::RelPath;
use crate::store::EntryStore;
use crate::util::hash::Fingerprinter;

/// How a merge resolves a path present in more than one input.
///
/// Has no default: every merge states its policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
  /// The earliest input in declared order wins.
  FirstWins,
  /// The latest input in declared order wins.
  LastWins,
  /// Any shared path fails the merge.
  Strict,
}

impl MergePolicy {
  pub fn as_str(&self) -> &'static str {
    match self {
      MergePolicy::FirstWins => "first-wins",
      MergePolicy::LastWins => "last-wins",
      MergePolicy::Strict => "strict",
    }
  }
}

#[derive(Debug, Clone)]
pub struct MergeNode {
  pub policy: MergePolicy,
}

impl MergeNode {
  pub fn new(policy: MergePolicy) -> Self {
    Self { policy }
  }

  /// Merge the labelled inputs in the order given.
  pub fn apply(&self, inputs: &[(&NodeId, &EntryStore)]) -> Result<EntryStore, NodeError> {
    let mut output = EntryStore::new();
    let mut owners: BTreeMap<RelPath, &NodeId> = BTreeMap::new();

    for &(id, store) in inputs {
      for entry in store.iter() {
        let Some(&owner) = owners.get(&entry.path) else {
          owners.insert(entry.path.clone(), id);
          output.insert(entry.clone())?;
          continue;
        };

        match self.policy {
          MergePolicy::FirstWins => trace!(path = %entry.path, kept = %owner, "merge keeps first"),
          MergePolicy::LastWins => {
            trace!(path = %entry.path, replaced = %owner, by = %id, "merge keeps last");
            owners.insert(entry.path.clone(), id);
            output.replace(entry.clone());
          }
          MergePolicy::Strict => {
            return Err(NodeError::MergeConflict {
              path: entry.path.clone(),
              first: owner.clone(),
              second: id.clone(),
            });
          }
        }
      }
    }

    Ok(output)
  }

  pub(crate) fn fingerprint_params(&self, hasher: &mut Fingerprinter) {
    hasher.field("policy", self.policy.as_str());
  }
}
