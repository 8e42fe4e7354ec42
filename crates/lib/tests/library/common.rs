use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arbor_lib::node::{
  CompileConfig, CompileOutput, Compiler, CompilerFailure, Diagnostic, MemoryScanner, NodeId, Scanner,
};
use arbor_lib::path::RelPath;
use arbor_lib::store::{Entry, EntryStore};

pub fn rel(path: &str) -> RelPath {
  RelPath::new(path).unwrap()
}

pub fn id(name: &str) -> NodeId {
  NodeId::from(name)
}

pub fn memory(files: &[(&str, &str)]) -> Arc<MemoryScanner> {
  let scanner = Arc::new(MemoryScanner::new());
  for (path, content) in files {
    scanner.write(path, *content).unwrap();
  }
  scanner
}

pub fn as_scanner(scanner: &Arc<MemoryScanner>) -> Arc<dyn Scanner> {
  scanner.clone()
}

pub fn read(store: &EntryStore, path: &str) -> String {
  let entry = store.get(&rel(path)).unwrap_or_else(|| panic!("missing entry {path}"));
  String::from_utf8(entry.content.read().unwrap().into_owned()).unwrap()
}

pub fn paths(store: &EntryStore) -> Vec<&str> {
  store.paths().map(RelPath::as_str).collect()
}

/// Every file under `dir`, relative and `/`-separated, sorted.
pub fn files_under(dir: &Path) -> Vec<String> {
  let mut found = Vec::new();
  collect(dir, dir, &mut found);
  found.sort();
  found
}

fn collect(root: &Path, dir: &Path, found: &mut Vec<String>) {
  let Ok(entries) = fs::read_dir(dir) else {
    return;
  };
  for entry in entries {
    let path = entry.unwrap().path();
    if path.is_dir() {
      collect(root, &path, found);
    } else {
      let relative = path.strip_prefix(root).unwrap();
      found.push(relative.to_string_lossy().replace('\\', "/"));
    }
  }
}

/// Downlevels `.ts` files by rewriting `let`/`const` to `var`. A line
/// `// @warn <text>` yields a warning, `// @error <text>` an error.
#[derive(Debug, Default)]
pub struct DownlevelCompiler {
  invocations: AtomicUsize,
}

impl DownlevelCompiler {
  pub fn invocations(&self) -> usize {
    self.invocations.load(Ordering::SeqCst)
  }
}

impl Compiler for DownlevelCompiler {
  fn fingerprint(&self) -> String {
    "downlevel-1".to_string()
  }

  fn compile(&self, entries: &EntryStore, _config: &CompileConfig) -> Result<CompileOutput, CompilerFailure> {
    self.invocations.fetch_add(1, Ordering::SeqCst);
    let mut output = CompileOutput::default();

    for entry in entries.iter().filter(|e| e.path.extension() == Some("ts")) {
      let source = String::from_utf8_lossy(&entry.content.read().map_err(CompilerFailure::Stage)?).into_owned();
      for (index, line) in source.lines().enumerate() {
        let at = |d: Diagnostic| d.at(entry.path.as_str(), index as u32 + 1, 1);
        if let Some(message) = line.strip_prefix("// @warn ") {
          output.diagnostics.push(at(Diagnostic::warning(message)));
        } else if let Some(message) = line.strip_prefix("// @error ") {
          output.diagnostics.push(at(Diagnostic::error(message)));
        }
      }

      let js = format!("{}.js", entry.path.as_str().trim_end_matches(".ts"));
      let body = source.replace("let ", "var ").replace("const ", "var ");
      output.entries.insert(Entry::from_bytes(rel(&js), body))?;
    }

    Ok(output)
  }
}
