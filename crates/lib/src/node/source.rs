//! Source nodes: leaf nodes that turn a directory into an entry store.
//!
//! The actual reading is done by a [`Scanner`]. [`FsScanner`] walks the real
//! filesystem; [`MemoryScanner`] serves an in-memory tree that tests (and
//! embedders) can mutate between passes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::glob::GlobSet;
use crate::path::{PathError, RelPath};
use crate::store::{Entry, EntryStore, StoreError};
use crate::util::hash::{FileHashError, Fingerprint, Fingerprinter, hash_file};

#[derive(Debug, Error)]
pub enum ScanError {
  #[error("source directory is unreadable: {path}: {message}")]
  Unreadable { path: String, message: String },

  #[error("failed to traverse {path}: {source}")]
  Walk {
    path: String,
    #[source]
    source: walkdir::Error,
  },

  #[error("file name is not valid UTF-8: {0}")]
  NonUtf8Path(String),

  #[error("invalid path '{path}': {source}")]
  Path {
    path: String,
    #[source]
    source: PathError,
  },

  #[error(transparent)]
  Hash(#[from] FileHashError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Produces the entries below a root directory.
pub trait Scanner: Send + Sync + fmt::Debug {
  /// Identifies the scanner implementation in node fingerprints.
  fn fingerprint(&self) -> String;

  /// Scan `root`, keeping files matching `include` and not matching `exclude`.
  fn scan(&self, root: &Path, include: &GlobSet, exclude: &GlobSet) -> Result<EntryStore, ScanError>;
}

fn selected(path: &RelPath, include: &GlobSet, exclude: &GlobSet) -> bool {
  include.is_match(path) && !exclude.is_match(path)
}

/// A leaf node reading one directory.
#[derive(Debug, Clone)]
pub struct SourceNode {
  pub root: PathBuf,
  pub include: GlobSet,
  pub exclude: GlobSet,
  pub scanner: Arc<dyn Scanner>,
}

impl SourceNode {
  /// A source node including every file below `root`.
  pub fn new(root: impl Into<PathBuf>, scanner: Arc<dyn Scanner>) -> Self {
    Self {
      root: root.into(),
      include: GlobSet::everything(),
      exclude: GlobSet::default(),
      scanner,
    }
  }

  pub fn include(mut self, include: GlobSet) -> Self {
    self.include = include;
    self
  }

  pub fn exclude(mut self, exclude: GlobSet) -> Self {
    self.exclude = exclude;
    self
  }

  pub fn scan(&self) -> Result<EntryStore, ScanError> {
    let store = self.scanner.scan(&self.root, &self.include, &self.exclude)?;
    debug!(root = ?self.root, entries = store.len(), "scanned source");
    Ok(store)
  }

  pub(crate) fn fingerprint_params(&self, hasher: &mut Fingerprinter) {
    hasher.field("root", &self.root.display().to_string());
    for pattern in self.include.patterns() {
      hasher.field("include", pattern);
    }
    for pattern in self.exclude.patterns() {
      hasher.field("exclude", pattern);
    }
    hasher.field("scanner", &self.scanner.fingerprint());
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
  modified: Option<SystemTime>,
  len: u64,
}

/// Scans the real filesystem with `walkdir`.
///
/// Content is not read during the scan: entries reference their files and
/// are read lazily. Files whose modification time and size are unchanged
/// since the previous scan reuse the previously computed hash. Hashes of
/// files that have disappeared from under a scanned root are dropped on the
/// next scan of that root.
#[derive(Debug, Default)]
pub struct FsScanner {
  memo: Mutex<HashMap<PathBuf, (FileStamp, Fingerprint)>>,
}

impl FsScanner {
  pub fn new() -> Self {
    Self::default()
  }

  fn fingerprint_file(&self, path: &Path, stamp: FileStamp) -> Result<Fingerprint, ScanError> {
    if let Ok(memo) = self.memo.lock()
      && let Some((known, fingerprint)) = memo.get(path)
      && *known == stamp
    {
      trace!(path = ?path, "reusing memoized file hash");
      return Ok(fingerprint.clone());
    }

    let fingerprint = hash_file(path)?;
    if let Ok(mut memo) = self.memo.lock() {
      memo.insert(path.to_path_buf(), (stamp, fingerprint.clone()));
    }
    Ok(fingerprint)
  }

  /// Forget files under `root` that the latest walk did not see. Other
  /// roots sharing this scanner keep their entries.
  fn forget_missing(&self, root: &Path, walked: &HashSet<PathBuf>) {
    if let Ok(mut memo) = self.memo.lock() {
      let before = memo.len();
      memo.retain(|path, _| !path.starts_with(root) || walked.contains(path));
      if memo.len() < before {
        trace!(root = ?root, forgotten = before - memo.len(), "dropped hashes of removed files");
      }
    }
  }
}

impl Scanner for FsScanner {
  fn fingerprint(&self) -> String {
    "fs".to_string()
  }

  fn scan(&self, root: &Path, include: &GlobSet, exclude: &GlobSet) -> Result<EntryStore, ScanError> {
    let metadata = std::fs::metadata(root).map_err(|e| ScanError::Unreadable {
      path: root.display().to_string(),
      message: e.to_string(),
    })?;
    if !metadata.is_dir() {
      return Err(ScanError::Unreadable {
        path: root.display().to_string(),
        message: "not a directory".to_string(),
      });
    }

    let mut store = EntryStore::new();
    let mut walked = HashSet::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
      let entry = entry.map_err(|e| ScanError::Walk {
        path: root.display().to_string(),
        source: e,
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      walked.insert(entry.path().to_path_buf());

      let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
      let raw = relative
        .to_str()
        .ok_or_else(|| ScanError::NonUtf8Path(relative.display().to_string()))?;
      let path = RelPath::new(raw).map_err(|source| ScanError::Path {
        path: raw.to_string(),
        source,
      })?;
      if !selected(&path, include, exclude) {
        continue;
      }

      let metadata = entry.metadata().map_err(|e| ScanError::Walk {
        path: entry.path().display().to_string(),
        source: e,
      })?;
      let stamp = FileStamp {
        modified: metadata.modified().ok(),
        len: metadata.len(),
      };
      let fingerprint = self.fingerprint_file(entry.path(), stamp)?;
      store.insert(Entry::from_file(path, entry.path().to_path_buf(), fingerprint))?;
    }

    self.forget_missing(root, &walked);
    Ok(store)
  }
}

/// An in-memory tree standing in for a directory.
///
/// The scanned root is ignored; every source node sharing a `MemoryScanner`
/// sees the same tree. Mutations become visible on the next pass.
#[derive(Debug, Default)]
pub struct MemoryScanner {
  files: Mutex<BTreeMap<RelPath, Arc<[u8]>>>,
}

impl MemoryScanner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create or overwrite a file.
  pub fn write(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<(), PathError> {
    let path = RelPath::new(path)?;
    let content: Vec<u8> = content.into();
    if let Ok(mut files) = self.files.lock() {
      files.insert(path, Arc::from(content));
    }
    Ok(())
  }

  /// Delete a file; returns whether it existed.
  pub fn remove(&self, path: &str) -> bool {
    let Ok(path) = RelPath::new(path) else {
      return false;
    };
    self.files.lock().map(|mut files| files.remove(&path).is_some()).unwrap_or(false)
  }
}

impl Scanner for MemoryScanner {
  fn fingerprint(&self) -> String {
    "memory".to_string()
  }

  fn scan(&self, root: &Path, include: &GlobSet, exclude: &GlobSet) -> Result<EntryStore, ScanError> {
    let files = self.files.lock().map_err(|_| ScanError::Unreadable {
      path: root.display().to_string(),
      message: "in-memory tree is poisoned".to_string(),
    })?;

    let mut store = EntryStore::new();
    for (path, content) in files.iter() {
      if selected(path, include, exclude) {
        store.insert(Entry::from_bytes(path.clone(), content.to_vec()))?;
      }
    }
    Ok(store)
  }
}
