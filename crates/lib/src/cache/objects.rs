//! Content-addressed blob storage for archived node outputs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::CacheError;
use crate::engine::{NodeRecord, OutputArchive};
use crate::node::NodeId;
use crate::path::RelPath;
use crate::store::{Entry, EntryStore};
use crate::util::hash::Fingerprint;

/// Blobs under `objects/`, one file per content fingerprint.
#[derive(Debug, Clone)]
pub struct ObjectStore {
  dir: PathBuf,
}

impl ObjectStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.dir.join(&fingerprint.0)
  }

  pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
    self.path(fingerprint).is_file()
  }

  /// Store an entry's content. Returns `false` if the blob already existed.
  pub fn put(&self, entry: &Entry) -> Result<bool, CacheError> {
    if self.contains(&entry.fingerprint) {
      return Ok(false);
    }
    fs::create_dir_all(&self.dir).map_err(CacheError::CreateDir)?;

    let bytes = entry.content.read().map_err(|source| CacheError::Content {
      path: entry.path.clone(),
      source,
    })?;
    let path = self.path(&entry.fingerprint);
    let temp_path = self.dir.join(format!("{}.tmp", entry.fingerprint.0));
    let object_error = |source| CacheError::Object {
      fingerprint: entry.fingerprint.clone(),
      source,
    };
    fs::write(&temp_path, &bytes).map_err(object_error)?;
    fs::rename(&temp_path, &path).map_err(object_error)?;
    Ok(true)
  }

  /// Store every entry of a node output. Returns the number of new blobs.
  pub fn put_all(&self, store: &EntryStore) -> Result<usize, CacheError> {
    let mut written = 0;
    for entry in store.iter() {
      if self.put(entry)? {
        written += 1;
      }
    }
    Ok(written)
  }

  /// Rebuild a store from `path -> fingerprint` pairs; `None` if a blob is
  /// missing. Entries reference the blobs lazily.
  pub fn load_entries(&self, entries: &BTreeMap<RelPath, Fingerprint>) -> Option<EntryStore> {
    let mut store = EntryStore::new();
    for (path, fingerprint) in entries {
      let blob = self.path(fingerprint);
      if !blob.is_file() {
        debug!(path = %path, object = %fingerprint.short(), "missing object");
        return None;
      }
      store
        .insert(Entry::from_file(path.clone(), blob, fingerprint.clone()))
        .ok()?;
    }
    Some(store)
  }
}

impl OutputArchive for ObjectStore {
  fn restore(&self, node: &NodeId, record: &NodeRecord) -> Option<EntryStore> {
    let entries = record.entries.as_ref()?;
    let store = self.load_entries(entries);
    if store.is_none() {
      debug!(node = %node, "archived output incomplete");
    }
    store
  }
}
