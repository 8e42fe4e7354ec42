//! Writing an entry store to a destination directory.
//!
//! The materializer keeps a record (`path -> fingerprint`) of what it last
//! wrote. Planning compares the store against that record:
//!
//! - a path absent from the record is `added`
//! - a path whose fingerprint differs, or whose file has vanished, is `updated`
//! - a path with the same fingerprint that still exists is `unchanged` and
//!   is never rewritten, so its mtime is preserved
//! - a recorded path absent from the store is `removed`

mod writer;

pub use writer::{FsWriter, Writer};

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::path::RelPath;
use crate::store::EntryStore;
use crate::util::hash::Fingerprint;

/// What the destination holds, as last written by the materializer.
pub type OutputRecord = BTreeMap<RelPath, Fingerprint>;

#[derive(Debug, Error)]
pub enum MaterializeError {
  #[error("failed to read content of '{path}': {source}")]
  Content {
    path: RelPath,
    #[source]
    source: io::Error,
  },

  #[error("failed to write '{path}' in {}: {source}", .dest.display())]
  Write {
    dest: PathBuf,
    path: RelPath,
    #[source]
    source: io::Error,
  },

  #[error("failed to remove '{path}' from {}: {source}", .dest.display())]
  Remove {
    dest: PathBuf,
    path: RelPath,
    #[source]
    source: io::Error,
  },

  #[error("plan lists '{0}', which is not in the store")]
  StalePlan(RelPath),
}

/// Changes needed to bring the destination in line with a store.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializePlan {
  pub added: Vec<RelPath>,
  pub updated: Vec<RelPath>,
  pub unchanged: Vec<RelPath>,
  pub removed: Vec<RelPath>,
}

impl MaterializePlan {
  /// Returns true if nothing would be written or removed.
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
  }

  pub fn writes(&self) -> usize {
    self.added.len() + self.updated.len()
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
  pub written: usize,
  pub removed: usize,
  pub unchanged: usize,
}

pub struct Materializer {
  dest: PathBuf,
  writer: Box<dyn Writer>,
  record: OutputRecord,
}

impl Materializer {
  /// `record` is what the previous materialization into `dest` wrote.
  pub fn new(dest: impl Into<PathBuf>, writer: Box<dyn Writer>, record: OutputRecord) -> Self {
    Self {
      dest: dest.into(),
      writer,
      record,
    }
  }

  /// A materializer writing to `dest` on disk.
  pub fn to_dir(dest: impl Into<PathBuf>, record: OutputRecord) -> Self {
    let dest = dest.into();
    let writer = Box::new(FsWriter::new(&dest));
    Self::new(dest, writer, record)
  }

  pub fn dest(&self) -> &Path {
    &self.dest
  }

  pub fn record(&self) -> &OutputRecord {
    &self.record
  }

  pub fn into_record(self) -> OutputRecord {
    self.record
  }

  pub fn plan(&self, store: &EntryStore) -> MaterializePlan {
    let mut plan = MaterializePlan::default();

    for entry in store.iter() {
      match self.record.get(&entry.path) {
        None => plan.added.push(entry.path.clone()),
        Some(previous) if *previous == entry.fingerprint && self.writer.exists(&entry.path) => {
          plan.unchanged.push(entry.path.clone())
        }
        Some(_) => plan.updated.push(entry.path.clone()),
      }
    }

    plan.removed = self.record.keys().filter(|path| !store.contains(path)).cloned().collect();
    plan
  }

  /// Carry out a plan computed from `store`.
  ///
  /// Removals run first so a file may be replaced by a directory of the
  /// same name. The record is updated after every step, so it stays
  /// accurate even when a step fails.
  pub fn apply(&mut self, store: &EntryStore, plan: &MaterializePlan) -> Result<MaterializeReport, MaterializeError> {
    let mut report = MaterializeReport {
      unchanged: plan.unchanged.len(),
      ..Default::default()
    };

    for path in &plan.removed {
      self.writer.remove(path).map_err(|source| MaterializeError::Remove {
        dest: self.dest.clone(),
        path: path.clone(),
        source,
      })?;
      self.record.remove(path);
      report.removed += 1;
      debug!(dest = %self.dest.display(), path = %path, "removed");
    }

    for path in plan.added.iter().chain(&plan.updated) {
      let entry = store.get(path).ok_or_else(|| MaterializeError::StalePlan(path.clone()))?;
      let content = entry.content.read().map_err(|source| MaterializeError::Content {
        path: path.clone(),
        source,
      })?;
      self.writer.write(path, &content).map_err(|source| MaterializeError::Write {
        dest: self.dest.clone(),
        path: path.clone(),
        source,
      })?;
      self.record.insert(path.clone(), entry.fingerprint.clone());
      report.written += 1;
      debug!(dest = %self.dest.display(), path = %path, "written");
    }

    info!(
      dest = %self.dest.display(),
      written = report.written,
      removed = report.removed,
      unchanged = report.unchanged,
      "materialized"
    );
    Ok(report)
  }

  /// Plan and apply in one step.
  pub fn materialize(&mut self, store: &EntryStore) -> Result<MaterializeReport, MaterializeError> {
    let plan = self.plan(store);
    self.apply(store, &plan)
  }
}
