//! Substitute nodes: ordered textual rewrites of entry content.
//!
//! Patterns run in declaration order over the content of every entry whose
//! path matches `files`. Replacement text is inserted literally; dynamic
//! replacements are computed once per entry from the entry's path, never
//! from its content.

use std::fmt;
use std::sync::Arc;

use regex::{NoExpand, Regex};
use tracing::{trace, warn};

use crate::glob::GlobSet;
use crate::node::NodeError;
use crate::path::RelPath;
use crate::placeholder::{self, PathResolver, PlaceholderError, Segment};
use crate::store::{Entry, EntryStore};
use crate::util::hash::Fingerprinter;

/// What a pattern looks for.
#[derive(Debug, Clone)]
pub enum Matcher {
  /// Every occurrence of a literal string.
  Literal(String),
  /// Every match of a regular expression. A regex that can match empty
  /// text at the end (`$`) inserts again on each application; use `End`.
  Regex(Regex),
  /// The end of the content; the replacement is appended once.
  End,
}

/// A replacement computed from the entry path.
#[derive(Debug, Clone)]
pub struct Template {
  source: String,
  segments: Vec<Segment>,
}

impl Template {
  /// Parse a `$${...}` path template (`path`, `dir`, `name`, `stem`, `ext`).
  pub fn parse(source: &str) -> Result<Self, PlaceholderError> {
    let segments = placeholder::parse(source)?;
    placeholder::validate_path_template(&segments)?;
    Ok(Self {
      source: source.to_string(),
      segments,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }

  pub fn render(&self, path: &RelPath) -> Result<String, PlaceholderError> {
    placeholder::substitute_segments(&self.segments, &PathResolver::new(path))
  }
}

type PathCallback = dyn Fn(&RelPath) -> String + Send + Sync;

/// A named pure function of the entry path.
///
/// The key stands in for the function body in fingerprints: two functions
/// registered under the same key must behave identically.
#[derive(Clone)]
pub struct PathFn {
  key: String,
  func: Arc<PathCallback>,
}

impl PathFn {
  pub fn new(key: impl Into<String>, func: impl Fn(&RelPath) -> String + Send + Sync + 'static) -> Self {
    Self {
      key: key.into(),
      func: Arc::new(func),
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn call(&self, path: &RelPath) -> String {
    (self.func)(path)
  }
}

impl fmt::Debug for PathFn {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PathFn").field("key", &self.key).finish_non_exhaustive()
  }
}

/// What a match is replaced with.
#[derive(Debug, Clone)]
pub enum Replacement {
  Literal(String),
  Template(Template),
  Func(PathFn),
}

impl Replacement {
  fn resolve(&self, path: &RelPath) -> Result<String, PlaceholderError> {
    match self {
      Replacement::Literal(text) => Ok(text.clone()),
      Replacement::Template(template) => template.render(path),
      Replacement::Func(func) => Ok(func.call(path)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Pattern {
  pub matcher: Matcher,
  pub replacement: Replacement,
}

impl Pattern {
  pub fn new(matcher: Matcher, replacement: Replacement) -> Self {
    Self { matcher, replacement }
  }

  pub fn literal(needle: impl Into<String>, replacement: impl Into<String>) -> Self {
    Self::new(Matcher::Literal(needle.into()), Replacement::Literal(replacement.into()))
  }

  fn apply(&self, text: String, replacement: &str) -> String {
    match &self.matcher {
      Matcher::Literal(needle) if needle.is_empty() => text,
      Matcher::Literal(needle) => text.replace(needle.as_str(), replacement),
      Matcher::Regex(regex) => regex.replace_all(&text, NoExpand(replacement)).into_owned(),
      Matcher::End if text.ends_with(replacement) => text,
      Matcher::End => text + replacement,
    }
  }

  fn fingerprint(&self, hasher: &mut Fingerprinter) {
    match &self.matcher {
      Matcher::Literal(needle) => hasher.field("match-literal", needle),
      Matcher::Regex(regex) => hasher.field("match-regex", regex.as_str()),
      Matcher::End => hasher.field("match-end", ""),
    };
    match &self.replacement {
      Replacement::Literal(text) => hasher.field("replace-literal", text),
      Replacement::Template(template) => hasher.field("replace-template", template.as_str()),
      Replacement::Func(func) => hasher.field("replace-fn", func.key()),
    };
  }
}

#[derive(Debug, Clone)]
pub struct SubstituteNode {
  pub files: GlobSet,
  pub patterns: Vec<Pattern>,
}

impl SubstituteNode {
  pub fn new(files: GlobSet, patterns: Vec<Pattern>) -> Self {
    Self { files, patterns }
  }

  pub fn apply(&self, input: &EntryStore) -> Result<EntryStore, NodeError> {
    let mut output = EntryStore::new();
    for entry in input.iter() {
      if self.files.is_match(&entry.path) {
        output.insert(self.rewrite(entry)?)?;
      } else {
        output.insert(entry.clone())?;
      }
    }
    Ok(output)
  }

  fn rewrite(&self, entry: &Entry) -> Result<Entry, NodeError> {
    let bytes = entry.content.read().map_err(|source| NodeError::Content {
      path: entry.path.clone(),
      source,
    })?;
    let Ok(original) = std::str::from_utf8(&bytes) else {
      warn!(path = %entry.path, "content is not UTF-8, passing through unchanged");
      return Ok(entry.clone());
    };

    let mut text = original.to_string();
    for pattern in &self.patterns {
      let replacement = pattern.replacement.resolve(&entry.path)?;
      text = pattern.apply(text, &replacement);
    }

    if text == original {
      return Ok(entry.clone());
    }
    trace!(path = %entry.path, "content rewritten");
    Ok(Entry::from_bytes(entry.path.clone(), text))
  }

  pub(crate) fn fingerprint_params(&self, hasher: &mut Fingerprinter) {
    for pattern in self.files.patterns() {
      hasher.field("files", pattern);
    }
    for pattern in &self.patterns {
      pattern.fingerprint(hasher);
    }
  }
}
