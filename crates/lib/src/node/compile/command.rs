//! A compiler that runs an external program.
//!
//! Each invocation stages the input entries into a fresh temporary
//! directory, runs the program with its arguments expanded, parses
//! diagnostics from its output and collects everything it wrote to the
//! output directory.
//!
//! # Argument placeholders
//!
//! - `$${src}`: the staged source directory (also the working directory)
//! - `$${out}`: the directory the program must write its output to
//! - `$${files}`: the staged input files; as a whole argument it expands to
//!   one argument per file
//! - `$${config:<field>}`: a [`CompileConfig`] field, e.g. `$${config:target}`

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::{CompileConfig, CompileOutput, Compiler, CompilerFailure, Diagnostic, Severity};
use crate::path::RelPath;
use crate::placeholder::{self, Placeholder, PlaceholderError, Resolver, Segment};
use crate::store::{Entry, EntryStore};

/// `file(line,col): error CODE: message`
static PAREN_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?P<file>.+?)\((?P<line>\d+),(?P<col>\d+)\): (?P<sev>error|warning|message) (?P<code>[A-Za-z]*\d+): (?P<msg>.*)$")
    .expect("valid diagnostic regex")
});

/// `file:line:col - error CODE: message`
static COLON_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?P<file>.+?):(?P<line>\d+):(?P<col>\d+) - (?P<sev>error|warning|message) (?P<code>[A-Za-z]*\d+): (?P<msg>.*)$")
    .expect("valid diagnostic regex")
});

/// `error CODE: message` without a location
static BARE_DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?P<sev>error|warning) (?P<code>[A-Za-z]*\d+): (?P<msg>.*)$").expect("valid diagnostic regex")
});

fn default_extensions() -> Vec<String> {
  vec!["ts".to_string(), "tsx".to_string()]
}

/// How to run the compiler program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
  pub program: String,
  #[serde(default)]
  pub args: Vec<String>,
  /// Extra environment variables; the parent environment is inherited.
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Extensions of the staged files listed by `$${files}`.
  #[serde(default = "default_extensions")]
  pub extensions: Vec<String>,
}

impl CommandSpec {
  pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      program: program.into(),
      args: args.into_iter().map(Into::into).collect(),
      env: BTreeMap::new(),
      extensions: default_extensions(),
    }
  }
}

#[derive(Debug)]
pub struct CommandCompiler {
  spec: CommandSpec,
  args: Vec<Vec<Segment>>,
}

impl CommandCompiler {
  pub fn new(spec: CommandSpec) -> Result<Self, PlaceholderError> {
    let args = spec
      .args
      .iter()
      .map(|arg| placeholder::parse(arg))
      .collect::<Result<Vec<_>, _>>()?;
    for segment in args.iter().flatten() {
      if let Segment::Placeholder(p) = segment
        && matches!(
          p,
          Placeholder::Path | Placeholder::Dir | Placeholder::Name | Placeholder::Stem | Placeholder::Ext
        )
      {
        return Err(PlaceholderError::Unsupported(placeholder::placeholder_name(p)));
      }
    }
    Ok(Self { spec, args })
  }

  pub fn spec(&self) -> &CommandSpec {
    &self.spec
  }

  fn expand_args(&self, resolver: &CommandResolver<'_>) -> Result<Vec<String>, PlaceholderError> {
    let mut expanded = Vec::new();
    for segments in &self.args {
      if let [Segment::Placeholder(Placeholder::Files)] = segments.as_slice() {
        expanded.extend(resolver.files.iter().cloned());
        continue;
      }
      expanded.push(placeholder::substitute_segments(segments, resolver)?);
    }
    Ok(expanded)
  }
}

struct CommandResolver<'a> {
  src: String,
  out: String,
  files: Vec<String>,
  config: &'a CompileConfig,
}

impl Resolver for CommandResolver<'_> {
  fn resolve(&self, placeholder: &Placeholder) -> Result<Cow<'_, str>, PlaceholderError> {
    match placeholder {
      Placeholder::Src => Ok(Cow::Borrowed(&self.src)),
      Placeholder::Out => Ok(Cow::Borrowed(&self.out)),
      Placeholder::Files => Ok(Cow::Owned(self.files.join(" "))),
      Placeholder::Config(field) => self
        .config
        .field(field)
        .map(Cow::Owned)
        .ok_or_else(|| PlaceholderError::UnknownConfigField(field.clone())),
      other => Err(PlaceholderError::Unsupported(placeholder::placeholder_name(other))),
    }
  }
}

impl Compiler for CommandCompiler {
  fn fingerprint(&self) -> String {
    let mut parts = vec![self.spec.program.clone()];
    parts.extend(self.spec.args.iter().cloned());
    for (key, value) in &self.spec.env {
      parts.push(format!("{key}={value}"));
    }
    parts.push(self.spec.extensions.join(","));
    parts.join("\u{1f}")
  }

  fn compile(&self, entries: &EntryStore, config: &CompileConfig) -> Result<CompileOutput, CompilerFailure> {
    let staging = tempfile::Builder::new()
      .prefix("arbor-compile-")
      .tempdir()
      .map_err(CompilerFailure::Stage)?;
    let src_dir = staging.path().join("src");
    let out_dir = staging.path().join("out");
    fs::create_dir_all(&src_dir).map_err(CompilerFailure::Stage)?;
    fs::create_dir_all(&out_dir).map_err(CompilerFailure::Stage)?;

    let mut files = BTreeSet::new();
    stage(entries, &src_dir, &self.spec.extensions, &mut files)?;
    for root in &config.root_file_paths {
      if entries.contains(root) {
        files.insert(root.to_native(&src_dir).display().to_string());
      }
    }

    let resolver = CommandResolver {
      src: src_dir.display().to_string(),
      out: out_dir.display().to_string(),
      files: files.into_iter().collect(),
      config,
    };
    let args = self.expand_args(&resolver)?;

    info!(program = %self.spec.program, inputs = entries.len(), "running compiler");
    debug!(args = ?args, cwd = ?src_dir, "spawning compiler");

    let output = Command::new(&self.spec.program)
      .args(&args)
      .current_dir(&src_dir)
      .envs(&self.spec.env)
      .output()
      .map_err(|source| CompilerFailure::Spawn {
        program: self.spec.program.clone(),
        source,
      })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut diagnostics = parse_diagnostics(&stdout, &src_dir);
    diagnostics.extend(parse_diagnostics(&stderr, &src_dir));

    if !output.status.success() {
      debug!(status = ?output.status.code(), stderr = %stderr, "compiler exited unsuccessfully");
      if !diagnostics.iter().any(Diagnostic::is_error) {
        let detail = stderr.trim();
        let message = match output.status.code() {
          Some(code) if detail.is_empty() => format!("{} exited with status {code}", self.spec.program),
          Some(code) => format!("{} exited with status {code}: {detail}", self.spec.program),
          None => format!("{} was terminated by a signal", self.spec.program),
        };
        diagnostics.push(Diagnostic::error(message));
      }
    }

    let entries = collect(&out_dir)?;
    Ok(CompileOutput { entries, diagnostics })
  }
}

fn stage(
  entries: &EntryStore,
  src_dir: &Path,
  extensions: &[String],
  files: &mut BTreeSet<String>,
) -> Result<(), CompilerFailure> {
  for entry in entries.iter() {
    let target = entry.path.to_native(src_dir);
    if let Some(parent) = target.parent() {
      fs::create_dir_all(parent).map_err(CompilerFailure::Stage)?;
    }
    let bytes = entry.content.read().map_err(CompilerFailure::Stage)?;
    fs::write(&target, bytes).map_err(CompilerFailure::Stage)?;

    if entry
      .path
      .extension()
      .is_some_and(|ext| extensions.iter().any(|wanted| wanted == ext))
    {
      files.insert(target.display().to_string());
    }
  }
  Ok(())
}

fn collect(out_dir: &Path) -> Result<EntryStore, CompilerFailure> {
  let mut store = EntryStore::new();
  for entry in WalkDir::new(out_dir).sort_by_file_name() {
    let entry = entry.map_err(|e| CompilerFailure::Collect(e.to_string()))?;
    if !entry.file_type().is_file() {
      continue;
    }
    let relative = entry
      .path()
      .strip_prefix(out_dir)
      .map_err(|e| CompilerFailure::Collect(e.to_string()))?;
    let raw = relative
      .to_str()
      .ok_or_else(|| CompilerFailure::Collect(format!("non UTF-8 output path {}", relative.display())))?;
    let path = RelPath::new(raw).map_err(|e| CompilerFailure::Collect(e.to_string()))?;
    let bytes = fs::read(entry.path()).map_err(|e| CompilerFailure::Collect(e.to_string()))?;
    store.insert(Entry::from_bytes(path, bytes))?;
  }
  Ok(store)
}

fn parse_severity(raw: &str) -> Severity {
  match raw {
    "error" => Severity::Error,
    "warning" => Severity::Warning,
    _ => Severity::Message,
  }
}

/// Parse compiler diagnostics, making file names relative to `src_dir`.
fn parse_diagnostics(output: &str, src_dir: &Path) -> Vec<Diagnostic> {
  let mut diagnostics = Vec::new();
  for line in output.lines() {
    let line = line.trim_end();
    if let Some(caps) = PAREN_DIAGNOSTIC.captures(line).or_else(|| COLON_DIAGNOSTIC.captures(line)) {
      let file = relative_file(&caps["file"], src_dir);
      let line_no = caps["line"].parse().unwrap_or(0);
      let column = caps["col"].parse().unwrap_or(0);
      diagnostics.push(
        Diagnostic::new(parse_severity(&caps["sev"]), &caps["msg"])
          .at(file, line_no, column)
          .with_code(&caps["code"]),
      );
    } else if let Some(caps) = BARE_DIAGNOSTIC.captures(line) {
      diagnostics.push(Diagnostic::new(parse_severity(&caps["sev"]), &caps["msg"]).with_code(&caps["code"]));
    }
  }
  diagnostics
}

fn relative_file(file: &str, src_dir: &Path) -> String {
  let path = Path::new(file);
  let canonical = dunce::canonicalize(src_dir).ok();
  let relative = path
    .strip_prefix(src_dir)
    .ok()
    .or_else(|| canonical.as_deref().and_then(|dir| path.strip_prefix(dir).ok()));
  match relative {
    Some(relative) => relative.to_string_lossy().replace('\\', "/"),
    None => file.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::node::compile::Target;

  #[test]
  fn parses_parenthesised_diagnostics() {
    let src = Path::new("/tmp/stage/src");
    let output = "/tmp/stage/src/angular2/core.ts(12,5): error TS2304: Cannot find name 'Foo'.\n\
                  lib.ts(1,1): warning TS6133: 'x' is declared but never used.\n\
                  unrelated noise";
    let diagnostics = parse_diagnostics(output, src);
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(
      diagnostics[0],
      Diagnostic::error("Cannot find name 'Foo'.").at("angular2/core.ts", 12, 5).with_code("TS2304")
    );
    assert_eq!(diagnostics[1].severity, Severity::Warning);
    assert_eq!(diagnostics[1].file.as_deref(), Some("lib.ts"));
  }

  #[test]
  fn parses_colon_and_bare_diagnostics() {
    let src = Path::new("/stage/src");
    let output = "a.ts:3:7 - error TS1005: ';' expected.\nerror TS5023: Unknown compiler option 'x'.";
    let diagnostics = parse_diagnostics(output, src);
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(diagnostics[0].line, Some(3));
    assert_eq!(diagnostics[0].column, Some(7));
    assert_eq!(diagnostics[1].file, None);
    assert_eq!(diagnostics[1].code.as_deref(), Some("TS5023"));
  }

  #[test]
  fn rejects_path_placeholders_in_arguments() {
    let spec = CommandSpec::new("tsc", ["$${dir}"]);
    assert_eq!(
      CommandCompiler::new(spec).unwrap_err(),
      PlaceholderError::Unsupported("dir".to_string())
    );
  }

  #[test]
  fn files_expands_to_one_argument_per_file() {
    let spec = CommandSpec::new("tsc", ["--outDir", "$${out}", "--target", "$${config:target}", "$${files}"]);
    let compiler = CommandCompiler::new(spec).unwrap();
    let config = CompileConfig::new(Target::Es5);
    let resolver = CommandResolver {
      src: "/s".to_string(),
      out: "/o".to_string(),
      files: vec!["/s/a.ts".to_string(), "/s/b.ts".to_string()],
      config: &config,
    };
    assert_eq!(
      compiler.expand_args(&resolver).unwrap(),
      vec!["--outDir", "/o", "--target", "es5", "/s/a.ts", "/s/b.ts"]
    );
  }

  #[test]
  fn unknown_config_field_is_an_error() {
    let compiler = CommandCompiler::new(CommandSpec::new("tsc", ["$${config:nope}"])).unwrap();
    let config = CompileConfig::new(Target::Es5);
    let resolver = CommandResolver {
      src: String::new(),
      out: String::new(),
      files: Vec::new(),
      config: &config,
    };
    assert_eq!(
      compiler.expand_args(&resolver).unwrap_err(),
      PlaceholderError::UnknownConfigField("nope".to_string())
    );
  }

  #[test]
  fn fingerprint_tracks_arguments() {
    let a = CommandCompiler::new(CommandSpec::new("tsc", ["--strict"])).unwrap();
    let b = CommandCompiler::new(CommandSpec::new("tsc", ["--noImplicitAny"])).unwrap();
    assert_ne!(a.fingerprint(), b.fingerprint());
  }

  #[cfg(unix)]
  #[test]
  fn runs_program_and_collects_output() {
    // copies every staged .ts file to a .js file of the same stem
    let script = r#"for f in "$@"; do rel="${f#$SRC/}"; mkdir -p "$OUT/$(dirname "$rel")"; cp "$f" "$OUT/${rel%.ts}.js"; done"#;
    let command = format!("SRC=\"$1\"; OUT=\"$2\"; shift 2; {script}");
    let spec = CommandSpec::new(
      "/bin/sh",
      [
        "-c",
        command.as_str(),
        "sh",
        "$${src}",
        "$${out}",
        "$${files}",
      ],
    );
    let compiler = CommandCompiler::new(spec).unwrap();
    let input = EntryStore::from_entries([
      Entry::from_bytes(RelPath::new("a/x.ts").unwrap(), "let x;"),
      Entry::from_bytes(RelPath::new("readme.md").unwrap(), "docs"),
    ])
    .unwrap();

    let output = compiler.compile(&input, &CompileConfig::new(Target::Es5)).unwrap();
    let paths: Vec<_> = output.entries.paths().map(RelPath::as_str).collect();
    assert_eq!(paths, vec!["a/x.js"]);
    assert!(output.diagnostics.is_empty());
  }

  #[cfg(unix)]
  #[test]
  fn failing_program_without_diagnostics_reports_an_error() {
    let compiler = CommandCompiler::new(CommandSpec::new("/bin/sh", ["-c", "echo boom >&2; exit 3"])).unwrap();
    let output = compiler.compile(&EntryStore::new(), &CompileConfig::new(Target::Es5)).unwrap();
    assert_eq!(output.diagnostics.len(), 1);
    assert!(output.diagnostics[0].is_error());
    assert!(output.diagnostics[0].message.contains("status 3: boom"));
  }

  #[test]
  fn missing_program_is_a_spawn_failure() {
    let compiler = CommandCompiler::new(CommandSpec::new("arbor-no-such-compiler", Vec::<String>::new())).unwrap();
    let err = compiler.compile(&EntryStore::new(), &CompileConfig::new(Target::Es5)).unwrap_err();
    assert!(matches!(err, CompilerFailure::Spawn { .. }));
  }
}
