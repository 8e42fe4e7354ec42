//! Persistent cache shared between invocations.
//!
//! # Storage Layout
//!
//! ```text
//! {cache_dir}/
//! ├── .lock           # CacheLock, held while a command uses the cache
//! ├── state.json      # CacheState: node records + materialization records
//! └── objects/<fp>    # archived content of persistent node outputs
//! ```

mod gc;
mod lock;
mod objects;
mod types;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::path::RelPath;
use crate::util::hash::Fingerprint;

pub use gc::{GcStats, sweep_objects};
pub use lock::{CacheLock, CacheLockError, LockMode, LockOwner};
pub use objects::ObjectStore;
pub use types::{CACHE_VERSION, CacheState};

const STATE_FILENAME: &str = "state.json";
const OBJECTS_DIR: &str = "objects";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("failed to create cache directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read cache: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write cache state: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse cache state: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize cache state: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to store object {fingerprint}: {source}")]
  Object {
    fingerprint: Fingerprint,
    #[source]
    source: io::Error,
  },

  #[error("failed to read content of '{path}': {source}")]
  Content {
    path: RelPath,
    #[source]
    source: io::Error,
  },

  #[error("failed to remove cache directory: {0}")]
  Remove(#[source] io::Error),
}

/// A cache directory on disk.
#[derive(Debug, Clone)]
pub struct Cache {
  root: PathBuf,
  objects: ObjectStore,
}

impl Cache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    let objects = ObjectStore::new(root.join(OBJECTS_DIR));
    Self { root, objects }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn objects(&self) -> &ObjectStore {
    &self.objects
  }

  fn state_path(&self) -> PathBuf {
    self.root.join(STATE_FILENAME)
  }

  pub fn lock(&self, mode: LockMode, owner: &LockOwner) -> Result<CacheLock, CacheLockError> {
    CacheLock::acquire(&self.root, mode, owner)
  }

  /// Load the cache state.
  ///
  /// Returns an empty state if the file doesn't exist or was written by a
  /// different format version.
  pub fn load(&self) -> Result<CacheState, CacheError> {
    let path = self.state_path();

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheState::default()),
      Err(e) => return Err(CacheError::Read(e)),
    };

    let state: CacheState = serde_json::from_str(&content).map_err(CacheError::Parse)?;
    if state.version != CACHE_VERSION {
      warn!(found = state.version, expected = CACHE_VERSION, "discarding cache of another version");
      return Ok(CacheState::default());
    }

    debug!(nodes = state.nodes.len(), outputs = state.outputs.len(), "loaded cache state");
    Ok(state)
  }

  /// Save the cache state.
  ///
  /// Uses atomic write (write to temp, then rename) to prevent corruption.
  pub fn save(&self, state: &CacheState) -> Result<(), CacheError> {
    fs::create_dir_all(&self.root).map_err(CacheError::CreateDir)?;

    let path = self.state_path();
    let temp_path = self.root.join("state.json.tmp");

    let content = serde_json::to_string_pretty(state).map_err(CacheError::Serialize)?;
    fs::write(&temp_path, &content).map_err(CacheError::Write)?;
    fs::rename(&temp_path, &path).map_err(CacheError::Write)?;

    debug!(path = %path.display(), "saved cache state");
    Ok(())
  }

  /// Delete the whole cache directory. Returns `false` if it did not exist.
  pub fn remove(&self) -> Result<bool, CacheError> {
    match fs::remove_dir_all(&self.root) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(CacheError::Remove(e)),
    }
  }
}
