//! Filter nodes: select entries by glob, re-root and relocate them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::glob::GlobSet;
use crate::node::NodeError;
use crate::path::RelPath;
use crate::store::EntryStore;
use crate::util::hash::Fingerprinter;

/// Which entries a filter keeps (before exclusion).
#[derive(Debug, Clone)]
pub enum Selection {
  /// Entries matching any of the globs.
  Globs(GlobSet),
  /// Exactly the listed paths.
  Files(BTreeSet<RelPath>),
}

/// Select, re-root and relocate entries.
///
/// Paths are matched after `src_dir` re-rooting. An entry is kept if it is
/// selected and does not match `exclude`; exclusion always wins. The kept
/// entry moves to `dest_dir/<path>`.
#[derive(Debug, Clone)]
pub struct FilterNode {
  pub selection: Selection,
  pub exclude: GlobSet,
  pub src_dir: Option<RelPath>,
  pub dest_dir: Option<RelPath>,
}

impl Default for FilterNode {
  fn default() -> Self {
    Self::new()
  }
}

impl FilterNode {
  /// A filter that keeps everything where it is.
  pub fn new() -> Self {
    Self {
      selection: Selection::Globs(GlobSet::everything()),
      exclude: GlobSet::default(),
      src_dir: None,
      dest_dir: None,
    }
  }

  /// Move every entry under `dest_dir`.
  pub fn relocate(dest_dir: RelPath) -> Self {
    Self::new().dest_dir(Some(dest_dir))
  }

  pub fn include(mut self, include: GlobSet) -> Self {
    self.selection = Selection::Globs(include);
    self
  }

  pub fn files(mut self, files: impl IntoIterator<Item = RelPath>) -> Self {
    self.selection = Selection::Files(files.into_iter().collect());
    self
  }

  pub fn exclude(mut self, exclude: GlobSet) -> Self {
    self.exclude = exclude;
    self
  }

  pub fn src_dir(mut self, src_dir: Option<RelPath>) -> Self {
    self.src_dir = src_dir;
    self
  }

  pub fn dest_dir(mut self, dest_dir: Option<RelPath>) -> Self {
    self.dest_dir = dest_dir;
    self
  }

  fn keeps(&self, path: &RelPath) -> bool {
    let selected = match &self.selection {
      Selection::Globs(globs) => globs.is_match(path),
      Selection::Files(files) => files.contains(path),
    };
    selected && !self.exclude.is_match(path)
  }

  pub fn apply(&self, input: &EntryStore) -> Result<EntryStore, NodeError> {
    let mut output = EntryStore::new();
    let mut origins: BTreeMap<RelPath, RelPath> = BTreeMap::new();

    for entry in input.iter() {
      let relative = match &self.src_dir {
        Some(src_dir) => match entry.path.strip_prefix(src_dir) {
          Some(relative) => relative,
          None => continue,
        },
        None => entry.path.clone(),
      };
      if !self.keeps(&relative) {
        trace!(path = %entry.path, "filtered out");
        continue;
      }

      let target = relative.under(self.dest_dir.as_ref());
      if let Some(first) = origins.get(&target) {
        return Err(NodeError::PathCollision {
          path: target,
          first: first.clone(),
          second: entry.path.clone(),
        });
      }
      origins.insert(target.clone(), entry.path.clone());
      output.insert(entry.relocated(target))?;
    }

    Ok(output)
  }

  pub(crate) fn fingerprint_params(&self, hasher: &mut Fingerprinter) {
    match &self.selection {
      Selection::Globs(globs) => {
        for pattern in globs.patterns() {
          hasher.field("include", pattern);
        }
      }
      Selection::Files(files) => {
        for file in files {
          hasher.field("file", file.as_str());
        }
      }
    }
    for pattern in self.exclude.patterns() {
      hasher.field("exclude", pattern);
    }
    hasher.field("src_dir", self.src_dir.as_ref().map(RelPath::as_str).unwrap_or(""));
    hasher.field("dest_dir", self.dest_dir.as_ref().map(RelPath::as_str).unwrap_or(""));
  }
}
