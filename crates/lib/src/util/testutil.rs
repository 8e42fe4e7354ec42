//! Test helpers for arbor-lib unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::node::{CompileConfig, CompileOutput, Compiler, CompilerFailure, Diagnostic};
use crate::path::RelPath;
use crate::store::{Entry, EntryStore};

pub fn rel(path: &str) -> RelPath {
  RelPath::new(path).unwrap()
}

/// Build an in-memory store from `(path, content)` pairs.
pub fn store(files: &[(&str, &str)]) -> EntryStore {
  EntryStore::from_entries(files.iter().map(|(path, content)| Entry::from_bytes(rel(path), *content))).unwrap()
}

/// Read an entry's content as UTF-8.
pub fn read(store: &EntryStore, path: &str) -> String {
  let entry = store.get(&rel(path)).unwrap_or_else(|| panic!("missing entry {path}"));
  String::from_utf8(entry.content.read().unwrap().into_owned()).unwrap()
}

pub fn paths(store: &EntryStore) -> Vec<&str> {
  store.paths().map(RelPath::as_str).collect()
}

/// A stand-in compiler: every `.ts` file (typings excluded) becomes a `.js`
/// file holding the source behind a target banner. Lines starting with
/// `// @error ` become error diagnostics.
#[derive(Debug, Default)]
pub struct TranscribeCompiler {
  invocations: AtomicUsize,
}

impl TranscribeCompiler {
  pub fn invocations(&self) -> usize {
    self.invocations.load(Ordering::SeqCst)
  }
}

impl Compiler for TranscribeCompiler {
  fn fingerprint(&self) -> String {
    "transcribe".to_string()
  }

  fn compile(&self, entries: &EntryStore, config: &CompileConfig) -> Result<CompileOutput, CompilerFailure> {
    self.invocations.fetch_add(1, Ordering::SeqCst);
    let target = config.field("target").unwrap_or_default();
    let mut output = CompileOutput::default();

    for entry in entries.iter() {
      if entry.path.extension() != Some("ts") || entry.path.as_str().ends_with(".d.ts") {
        continue;
      }
      let bytes = entry.content.read().map_err(CompilerFailure::Stage)?;
      let source = String::from_utf8_lossy(&bytes);
      for (index, line) in source.lines().enumerate() {
        if let Some(message) = line.strip_prefix("// @error ") {
          output
            .diagnostics
            .push(Diagnostic::error(message).at(entry.path.as_str(), index as u32 + 1, 1).with_code("TS9999"));
        }
      }

      let stem = entry.path.file_stem();
      let js = match entry.path.parent() {
        Some(dir) => dir.join(&rel(&format!("{stem}.js"))),
        None => rel(&format!("{stem}.js")),
      };
      output
        .entries
        .insert(Entry::from_bytes(js, format!("// target: {target}\n{source}")))?;
    }

    Ok(output)
  }
}
