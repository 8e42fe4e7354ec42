//! Hashing utilities for content fingerprints and cache invalidation.
//!
//! This module provides:
//! - `Fingerprint`: a full 64-character SHA-256 hex digest
//! - `Fingerprinter`: an incremental builder for combined fingerprints
//! - `Hashable`: fingerprinting of serializable parameter structs
//! - `hash_file()` / `hash_bytes()`: content hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::consts::SHORT_FINGERPRINT_LEN;

pub type HashError = serde_json::Error;

/// A SHA-256 digest identifying content, parameters, or a whole entry store.
///
/// # Format
///
/// A lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  /// The abbreviated form used in log lines and CLI output.
  pub fn short(&self) -> &str {
    let len = self.0.len().min(SHORT_FINGERPRINT_LEN);
    &self.0[..len]
  }
}

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Incremental fingerprint builder.
///
/// Every field is written as `tag:value\n` so that adjacent fields cannot
/// run together and produce the same digest for different inputs.
pub struct Fingerprinter {
  hasher: Sha256,
}

impl Fingerprinter {
  pub fn new(domain: &str) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(b"D:");
    hasher.update(domain.as_bytes());
    hasher.update(b"\n");
    Self { hasher }
  }

  pub fn field(&mut self, tag: &str, value: &str) -> &mut Self {
    self.hasher.update(tag.as_bytes());
    self.hasher.update(b":");
    self.hasher.update(value.len().to_string().as_bytes());
    self.hasher.update(b":");
    self.hasher.update(value.as_bytes());
    self.hasher.update(b"\n");
    self
  }

  pub fn fingerprint(&mut self, tag: &str, value: &Fingerprint) -> &mut Self {
    self.field(tag, &value.0)
  }

  pub fn finish(self) -> Fingerprint {
    Fingerprint(hex::encode(self.hasher.finalize()))
  }
}

/// Fingerprinting for parameter structs.
///
/// The fingerprint is the SHA-256 of the struct's JSON serialization, so
/// every serialized field participates in cache invalidation.
pub trait Hashable: Serialize {
  fn compute_fingerprint(&self) -> Result<Fingerprint, HashError> {
    let serialized = serde_json::to_string(self)?;
    Ok(hash_bytes(serialized.as_bytes()))
  }
}

/// Error while hashing a file.
#[derive(Debug, thiserror::Error)]
#[error("failed to read file {path}: {source}")]
pub struct FileHashError {
  pub path: String,
  #[source]
  pub source: std::io::Error,
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA-256 hash of the file.
pub fn hash_file(path: &Path) -> Result<Fingerprint, FileHashError> {
  let read_err = |source| FileHashError {
    path: path.display().to_string(),
    source,
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_err)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA-256 hash.
pub fn hash_bytes(data: &[u8]) -> Fingerprint {
  let mut hasher = Sha256::new();
  hasher.update(data);
  Fingerprint(hex::encode(hasher.finalize()))
}
