//! Relative tree paths.
//!
//! Every entry in a virtual tree is addressed by a [`RelPath`]: a POSIX-style,
//! slash-separated path that is never empty and never escapes the tree root.
//! All path manipulation in the pipeline (prefixing, flattening, re-rooting)
//! goes through this type rather than through string splitting, so separator
//! handling is defined in exactly one place.
//!
//! # Normalization
//!
//! - `\` is treated as a separator and rewritten to `/`
//! - empty segments (`a//b`, leading or trailing `/`) and `.` are dropped
//! - `..` removes the preceding segment; climbing above the root is an error
//!
//! ```
//! use arbor_lib::path::RelPath;
//!
//! let path = RelPath::new("/examples\\src//./hello/../todo/index.html").unwrap();
//! assert_eq!(path.as_str(), "examples/src/todo/index.html");
//! assert_eq!(path.file_name(), "index.html");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
  #[error("path is empty after normalization: '{0}'")]
  Empty(String),

  #[error("path escapes the tree root: '{0}'")]
  EscapesRoot(String),
}

/// A normalized, non-empty path relative to a tree root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(String);

impl RelPath {
  /// Parse and normalize a relative path.
  pub fn new(raw: &str) -> Result<Self, PathError> {
    let segments = normalize_segments(raw)?;
    if segments.is_empty() {
      return Err(PathError::Empty(raw.to_string()));
    }
    Ok(Self(segments.join("/")))
  }

  /// Parse a destination prefix.
  ///
  /// The tree root (`""`, `"/"`, `"."`) is represented as `None`.
  pub fn parse_prefix(raw: &str) -> Result<Option<Self>, PathError> {
    let segments = normalize_segments(raw)?;
    if segments.is_empty() {
      Ok(None)
    } else {
      Ok(Some(Self(segments.join("/"))))
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.0.split('/')
  }

  /// The final path segment.
  pub fn file_name(&self) -> &str {
    match self.0.rfind('/') {
      Some(pos) => &self.0[pos + 1..],
      None => &self.0,
    }
  }

  /// The final segment as a top-level path.
  pub fn flattened(&self) -> RelPath {
    Self(self.file_name().to_string())
  }

  /// The final segment without its last extension.
  ///
  /// Dotfiles such as `.npmrc` have no stem split: the whole name is the stem.
  pub fn file_stem(&self) -> &str {
    let name = self.file_name();
    match name.rfind('.') {
      Some(0) | None => name,
      Some(pos) => &name[..pos],
    }
  }

  /// The last extension of the final segment, without the dot.
  pub fn extension(&self) -> Option<&str> {
    let name = self.file_name();
    match name.rfind('.') {
      Some(0) | None => None,
      Some(pos) => Some(&name[pos + 1..]),
    }
  }

  /// The directory portion, or `None` for a top-level entry.
  pub fn parent(&self) -> Option<RelPath> {
    self.0.rfind('/').map(|pos| Self(self.0[..pos].to_string()))
  }

  /// The directory portion as a string, empty for a top-level entry.
  pub fn dir_str(&self) -> &str {
    match self.0.rfind('/') {
      Some(pos) => &self.0[..pos],
      None => "",
    }
  }

  /// Append a child path.
  pub fn join(&self, child: &RelPath) -> RelPath {
    Self(format!("{}/{}", self.0, child.0))
  }

  /// Place this path under an optional prefix.
  pub fn under(&self, prefix: Option<&RelPath>) -> RelPath {
    match prefix {
      Some(prefix) => prefix.join(self),
      None => self.clone(),
    }
  }

  /// True if `prefix` is this path or one of its ancestor directories.
  pub fn starts_with(&self, prefix: &RelPath) -> bool {
    self.0 == prefix.0 || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
  }

  /// The remainder of this path below `prefix`.
  ///
  /// Returns `None` if `prefix` is not a proper ancestor directory.
  pub fn strip_prefix(&self, prefix: &RelPath) -> Option<RelPath> {
    if self.0.len() > prefix.0.len() && self.starts_with(prefix) {
      Some(Self(self.0[prefix.0.len() + 1..].to_string()))
    } else {
      None
    }
  }

  /// Convert to a native path below `root`.
  pub fn to_native(&self, root: &std::path::Path) -> std::path::PathBuf {
    let mut out = root.to_path_buf();
    for segment in self.segments() {
      out.push(segment);
    }
    out
  }
}

fn normalize_segments(raw: &str) -> Result<Vec<&str>, PathError> {
  let mut segments: Vec<&str> = Vec::new();
  for segment in raw.split(['/', '\\']) {
    match segment {
      "" | "." => {}
      ".." => {
        if segments.pop().is_none() {
          return Err(PathError::EscapesRoot(raw.to_string()));
        }
      }
      other => segments.push(other),
    }
  }
  Ok(segments)
}

impl fmt::Display for RelPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for RelPath {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::new(s)
  }
}

impl AsRef<str> for RelPath {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

impl Serialize for RelPath {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for RelPath {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    RelPath::new(&raw).map_err(serde::de::Error::custom)
  }
}
