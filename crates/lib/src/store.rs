//! Entries and entry stores: the unit every node reads and produces.
//!
//! An [`EntryStore`] is an ordered map from [`RelPath`] to [`Entry`]. Paths are
//! unique within a store; inserting a second entry at an existing path is an
//! error, never a silent overwrite. Resolving duplicates is the job of the
//! merge node's policy, not of the store.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::path::RelPath;
use crate::util::hash::{Fingerprint, Fingerprinter, hash_bytes};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("duplicate path in entry store: {0}")]
  DuplicatePath(RelPath),
}

/// Where an entry's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
  /// Bytes held in memory (produced by a transform or a compiler).
  Bytes(Arc<[u8]>),
  /// A file on disk, read lazily (produced by a directory scan).
  File(PathBuf),
}

impl Content {
  pub fn read(&self) -> io::Result<Cow<'_, [u8]>> {
    match self {
      Content::Bytes(bytes) => Ok(Cow::Borrowed(&bytes[..])),
      Content::File(path) => std::fs::read(path).map(Cow::Owned),
    }
  }

  pub fn file_path(&self) -> Option<&Path> {
    match self {
      Content::File(path) => Some(path),
      Content::Bytes(_) => None,
    }
  }
}

/// One `(path, content)` unit in a virtual tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  pub path: RelPath,
  pub content: Content,
  /// SHA-256 of the content bytes.
  pub fingerprint: Fingerprint,
}

impl Entry {
  /// Create an in-memory entry, fingerprinting its bytes.
  pub fn from_bytes(path: RelPath, bytes: impl Into<Vec<u8>>) -> Self {
    let bytes: Vec<u8> = bytes.into();
    let fingerprint = hash_bytes(&bytes);
    Self {
      path,
      content: Content::Bytes(Arc::from(bytes)),
      fingerprint,
    }
  }

  /// Create an entry referencing a file whose fingerprint is already known.
  pub fn from_file(path: RelPath, file: PathBuf, fingerprint: Fingerprint) -> Self {
    Self {
      path,
      content: Content::File(file),
      fingerprint,
    }
  }

  /// The same content at a different path.
  pub fn relocated(&self, path: RelPath) -> Self {
    Self {
      path,
      content: self.content.clone(),
      fingerprint: self.fingerprint.clone(),
    }
  }
}

/// The full set of entries produced by a node, keyed and ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryStore {
  entries: BTreeMap<RelPath, Entry>,
}

impl EntryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a store from entries, failing on the first duplicate path.
  pub fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Result<Self, StoreError> {
    let mut store = Self::new();
    for entry in entries {
      store.insert(entry)?;
    }
    Ok(store)
  }

  /// Insert an entry; a path already present is rejected.
  pub fn insert(&mut self, entry: Entry) -> Result<(), StoreError> {
    match self.entries.entry(entry.path.clone()) {
      btree_map::Entry::Occupied(_) => Err(StoreError::DuplicatePath(entry.path)),
      btree_map::Entry::Vacant(slot) => {
        slot.insert(entry);
        Ok(())
      }
    }
  }

  /// Insert or overwrite, returning the previous entry.
  pub(crate) fn replace(&mut self, entry: Entry) -> Option<Entry> {
    self.entries.insert(entry.path.clone(), entry)
  }

  pub fn get(&self, path: &RelPath) -> Option<&Entry> {
    self.entries.get(path)
  }

  pub fn contains(&self, path: &RelPath) -> bool {
    self.entries.contains_key(path)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Entry> {
    self.entries.values()
  }

  pub fn paths(&self) -> impl Iterator<Item = &RelPath> {
    self.entries.keys()
  }

  /// Combined fingerprint over every `(path, content fingerprint)` pair.
  pub fn fingerprint(&self) -> Fingerprint {
    let mut hasher = Fingerprinter::new("entry-store");
    for entry in self.entries.values() {
      hasher.field("P", entry.path.as_str());
      hasher.fingerprint("C", &entry.fingerprint);
    }
    hasher.finish()
  }
}

impl IntoIterator for EntryStore {
  type Item = Entry;
  type IntoIter = btree_map::IntoValues<RelPath, Entry>;

  fn into_iter(self) -> Self::IntoIter {
    self.entries.into_values()
  }
}
