//! Compile nodes: hand a batch of entries to a compiler collaborator.
//!
//! The engine never type-checks or transpiles anything itself. A
//! [`Compiler`] receives the whole input store plus an immutable
//! [`CompileConfig`] and returns the emitted entries together with any
//! diagnostics. One input may produce several outputs (`.js`, `.d.ts`,
//! `.js.map`).
//!
//! With `no_emit_on_error` set, a single error diagnostic fails the node and
//! nothing is emitted. Otherwise the output is kept and every diagnostic is
//! surfaced as a pass warning.

mod command;

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::node::{NodeError, NodeOutput};
use crate::path::RelPath;
use crate::placeholder::PlaceholderError;
use crate::store::{EntryStore, StoreError};
use crate::util::hash::{Fingerprinter, Hashable};

pub use command::{CommandCompiler, CommandSpec};

/// ECMAScript level of the emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
  Es3,
  Es5,
  Es6,
  Es2015,
  Es2016,
  Es2017,
  EsNext,
}

/// Module system of the emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
  CommonJs,
  Amd,
  System,
  Umd,
  Es2015,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleResolution {
  #[default]
  Classic,
  Node,
}

/// Options handed to the compiler; immutable for the life of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompileConfig {
  pub target: Target,
  #[serde(default)]
  pub module: Option<ModuleKind>,
  #[serde(default)]
  pub module_resolution: ModuleResolution,
  #[serde(default)]
  pub declaration: bool,
  #[serde(default)]
  pub no_emit_on_error: bool,
  #[serde(default)]
  pub source_map: bool,
  #[serde(default)]
  pub strip_internal: bool,
  #[serde(default)]
  pub emit_decorator_metadata: bool,
  #[serde(default)]
  pub experimental_decorators: bool,
  /// Extra roots (typings) the compiler should see besides the input files.
  #[serde(default)]
  pub root_file_paths: Vec<RelPath>,
}

impl Hashable for CompileConfig {}

impl CompileConfig {
  pub fn new(target: Target) -> Self {
    Self {
      target,
      module: None,
      module_resolution: ModuleResolution::default(),
      declaration: false,
      no_emit_on_error: false,
      source_map: false,
      strip_internal: false,
      emit_decorator_metadata: false,
      experimental_decorators: false,
      root_file_paths: Vec::new(),
    }
  }

  /// A field rendered as a command-line value.
  ///
  /// Booleans render as `true`/`false`, lists are comma-joined and unset
  /// options render empty. Unknown fields yield `None`.
  pub fn field(&self, name: &str) -> Option<String> {
    let value = serde_json::to_value(self).ok()?;
    let field = value.get(name)?;
    Some(match field {
      serde_json::Value::Null => String::new(),
      serde_json::Value::String(s) => s.clone(),
      serde_json::Value::Array(items) => items
        .iter()
        .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
        .collect::<Vec<_>>()
        .join(","),
      other => other.to_string(),
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Error,
  Warning,
  Message,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Severity::Error => f.write_str("error"),
      Severity::Warning => f.write_str("warning"),
      Severity::Message => f.write_str("message"),
    }
  }
}

/// One compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub severity: Severity,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub column: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code: Option<String>,
  pub message: String,
}

impl Diagnostic {
  pub fn new(severity: Severity, message: impl Into<String>) -> Self {
    Self {
      severity,
      file: None,
      line: None,
      column: None,
      code: None,
      message: message.into(),
    }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self::new(Severity::Error, message)
  }

  pub fn warning(message: impl Into<String>) -> Self {
    Self::new(Severity::Warning, message)
  }

  pub fn at(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
    self.file = Some(file.into());
    self.line = Some(line);
    self.column = Some(column);
    self
  }

  pub fn with_code(mut self, code: impl Into<String>) -> Self {
    self.code = Some(code.into());
    self
  }

  pub fn is_error(&self) -> bool {
    self.severity == Severity::Error
  }
}

impl fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(file) = &self.file {
      f.write_str(file)?;
      if let (Some(line), Some(column)) = (self.line, self.column) {
        write!(f, "({line},{column})")?;
      }
      f.write_str(": ")?;
    }
    write!(f, "{}", self.severity)?;
    if let Some(code) = &self.code {
      write!(f, " {code}")?;
    }
    write!(f, ": {}", self.message)
  }
}

/// Entries and diagnostics produced by one compiler invocation.
#[derive(Debug, Default)]
pub struct CompileOutput {
  pub entries: EntryStore,
  pub diagnostics: Vec<Diagnostic>,
}

/// The compiler could not run at all (as opposed to reporting diagnostics).
#[derive(Debug, Error)]
pub enum CompilerFailure {
  #[error("failed to stage compiler input: {0}")]
  Stage(#[source] io::Error),

  #[error("failed to start '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to collect compiler output: {0}")]
  Collect(String),

  #[error("invalid compiler arguments: {0}")]
  Arguments(#[from] PlaceholderError),

  #[error(transparent)]
  Output(#[from] StoreError),
}

/// A compiler collaborator.
pub trait Compiler: Send + Sync + fmt::Debug {
  /// Identifies the compiler (program, version, arguments) for cache
  /// invalidation.
  fn fingerprint(&self) -> String;

  fn compile(&self, entries: &EntryStore, config: &CompileConfig) -> Result<CompileOutput, CompilerFailure>;
}

#[derive(Debug, Clone)]
pub struct CompileNode {
  pub config: CompileConfig,
  pub compiler: std::sync::Arc<dyn Compiler>,
}

impl CompileNode {
  pub fn new(config: CompileConfig, compiler: std::sync::Arc<dyn Compiler>) -> Self {
    Self { config, compiler }
  }

  pub fn apply(&self, input: &EntryStore) -> Result<NodeOutput, NodeError> {
    let output = self.compiler.compile(input, &self.config)?;
    let errors = output.diagnostics.iter().filter(|d| d.is_error()).count();
    debug!(
      inputs = input.len(),
      outputs = output.entries.len(),
      diagnostics = output.diagnostics.len(),
      errors,
      "compiled"
    );

    if errors > 0 && self.config.no_emit_on_error {
      return Err(NodeError::Compile {
        diagnostics: output.diagnostics,
      });
    }

    Ok(NodeOutput {
      store: output.entries,
      diagnostics: output.diagnostics,
    })
  }

  pub(crate) fn fingerprint_params(&self, hasher: &mut Fingerprinter) -> Result<(), serde_json::Error> {
    hasher.fingerprint("config", &self.config.compute_fingerprint()?);
    hasher.field("compiler", &self.compiler.fingerprint());
    Ok(())
  }
}
