//! Destination writers.

use std::fmt::Debug;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::trace;

use crate::path::RelPath;

/// Where materialized entries land. Paths are relative to the destination.
pub trait Writer: Send + Sync + Debug {
  fn write(&self, path: &RelPath, content: &[u8]) -> io::Result<()>;

  /// Remove a file; a missing file is not an error.
  fn remove(&self, path: &RelPath) -> io::Result<()>;

  fn exists(&self, path: &RelPath) -> bool;
}

/// Writes into a directory on disk.
///
/// Files are written to a temp file beside the target and renamed into
/// place. Directories emptied by a removal are pruned up to the root.
#[derive(Debug, Clone)]
pub struct FsWriter {
  root: PathBuf,
}

impl FsWriter {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
    while let Some(current) = dir {
      if current == self.root || !current.starts_with(&self.root) {
        break;
      }
      // Fails (and stops) on the first non-empty directory.
      if fs::remove_dir(current).is_err() {
        break;
      }
      trace!(dir = %current.display(), "pruned empty directory");
      dir = current.parent();
    }
  }
}

impl Writer for FsWriter {
  fn write(&self, path: &RelPath, content: &[u8]) -> io::Result<()> {
    let target = path.to_native(&self.root);
    let parent = target.parent().unwrap_or(&self.root);
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.persist(&target).map_err(|e| e.error)?;
    Ok(())
  }

  fn remove(&self, path: &RelPath) -> io::Result<()> {
    let target = path.to_native(&self.root);
    match fs::remove_file(&target) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(e),
    }
    self.prune_empty_dirs(target.parent());
    Ok(())
  }

  fn exists(&self, path: &RelPath) -> bool {
    path.to_native(&self.root).is_file()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::rel;

  #[test]
  fn write_creates_parents() {
    let temp = tempfile::tempdir().unwrap();
    let writer = FsWriter::new(temp.path());
    writer.write(&rel("a/b/c.js"), b"content").unwrap();

    assert_eq!(fs::read(temp.path().join("a/b/c.js")).unwrap(), b"content");
    assert!(writer.exists(&rel("a/b/c.js")));
    assert!(!writer.exists(&rel("a/b")));
  }

  #[test]
  fn write_replaces_existing_file() {
    let temp = tempfile::tempdir().unwrap();
    let writer = FsWriter::new(temp.path());
    writer.write(&rel("x.js"), b"one").unwrap();
    writer.write(&rel("x.js"), b"two").unwrap();
    assert_eq!(fs::read(temp.path().join("x.js")).unwrap(), b"two");
  }

  #[test]
  fn remove_prunes_empty_dirs_but_not_root() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("dist");
    let writer = FsWriter::new(&root);
    writer.write(&rel("a/b/c.js"), b"1").unwrap();
    writer.write(&rel("a/keep.js"), b"2").unwrap();

    writer.remove(&rel("a/b/c.js")).unwrap();
    assert!(!root.join("a/b").exists());
    assert!(root.join("a/keep.js").exists());

    writer.remove(&rel("a/keep.js")).unwrap();
    assert!(!root.join("a").exists());
    assert!(root.exists());

    writer.remove(&rel("never/there.js")).unwrap();
  }
}
