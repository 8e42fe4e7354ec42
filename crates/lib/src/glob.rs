//! Glob patterns over tree paths.
//!
//! Patterns are compiled once, at graph construction, into anchored regular
//! expressions and matched against [`RelPath`] strings.
//!
//! # Syntax
//!
//! - `*` matches any run of characters within one segment
//! - `?` matches one character within a segment
//! - `**` as a whole segment matches zero or more segments
//! - `{a,b}` matches either alternative (alternatives may nest)
//! - `[abc]`, `[a-z]`, `[!abc]` match one character from a class
//! - `\x` matches `x` literally
//!
//! Dotfiles are not special: `*` matches `.gitignore`.

use std::fmt;

use regex::Regex;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::path::RelPath;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobError {
  #[error("unclosed '{{' in glob '{0}'")]
  UnclosedBrace(String),

  #[error("unclosed '[' in glob '{0}'")]
  UnclosedClass(String),

  #[error("invalid glob '{pattern}': {message}")]
  Invalid { pattern: String, message: String },
}

/// A single compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
  pattern: String,
  regex: Regex,
}

impl Glob {
  pub fn new(pattern: &str) -> Result<Self, GlobError> {
    let trimmed = pattern.trim_start_matches("./").trim_start_matches('/');
    let source = translate(trimmed, pattern)?;
    let regex = Regex::new(&source).map_err(|e| GlobError::Invalid {
      pattern: pattern.to_string(),
      message: e.to_string(),
    })?;
    Ok(Self {
      pattern: pattern.to_string(),
      regex,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.pattern
  }

  pub fn is_match(&self, path: &RelPath) -> bool {
    self.regex.is_match(path.as_str())
  }
}

impl fmt::Display for Glob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.pattern)
  }
}

/// An ordered set of globs; a path matches the set if it matches any member.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
  globs: Vec<Glob>,
}

impl GlobSet {
  pub fn new<I, S>(patterns: I) -> Result<Self, GlobError>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let globs = patterns
      .into_iter()
      .map(|p| Glob::new(p.as_ref()))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self { globs })
  }

  /// A set matching every path.
  pub fn everything() -> Self {
    Self {
      globs: vec![Glob {
        pattern: "**".to_string(),
        regex: Regex::new("^.*$").expect("static regex"),
      }],
    }
  }

  pub fn is_empty(&self) -> bool {
    self.globs.is_empty()
  }

  pub fn is_match(&self, path: &RelPath) -> bool {
    self.globs.iter().any(|g| g.is_match(path))
  }

  pub fn patterns(&self) -> impl Iterator<Item = &str> {
    self.globs.iter().map(Glob::as_str)
  }
}

impl Serialize for GlobSet {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(self.patterns())
  }
}

fn translate(pattern: &str, original: &str) -> Result<String, GlobError> {
  let chars: Vec<char> = pattern.chars().collect();
  let mut out = String::from("^");
  let mut brace_depth = 0usize;
  let mut i = 0;

  let is_boundary_before = |i: usize, depth: usize| {
    i == 0 || chars[i - 1] == '/' || (depth > 0 && matches!(chars[i - 1], '{' | ','))
  };

  while i < chars.len() {
    let c = chars[i];
    match c {
      '*' => {
        if chars.get(i + 1) == Some(&'*') {
          let after = i + 2;
          let at_start = is_boundary_before(i, brace_depth);
          let next = chars.get(after).copied();
          let at_end = match next {
            None | Some('/') => true,
            Some('}') | Some(',') => brace_depth > 0,
            _ => false,
          };

          if at_start && next == Some('/') {
            // `**/` spans zero or more whole directories
            out.push_str("(?:[^/]*/)*");
            i = after + 1;
            continue;
          }
          if at_start && at_end {
            out.push_str(".*");
            i = after;
            continue;
          }
          out.push_str("[^/]*");
          i = after;
          continue;
        }
        out.push_str("[^/]*");
      }
      '?' => out.push_str("[^/]"),
      '{' => {
        brace_depth += 1;
        out.push_str("(?:");
      }
      '}' if brace_depth > 0 => {
        brace_depth -= 1;
        out.push(')');
      }
      ',' if brace_depth > 0 => out.push('|'),
      '[' => {
        let (class, end) = translate_class(&chars, i).ok_or_else(|| GlobError::UnclosedClass(original.to_string()))?;
        out.push_str(&class);
        i = end + 1;
        continue;
      }
      '\\' => {
        if let Some(next) = chars.get(i + 1) {
          out.push_str(&regex::escape(&next.to_string()));
          i += 2;
          continue;
        }
        out.push_str("\\\\");
      }
      other => out.push_str(&regex::escape(&other.to_string())),
    }
    i += 1;
  }

  if brace_depth > 0 {
    return Err(GlobError::UnclosedBrace(original.to_string()));
  }

  out.push('$');
  Ok(out)
}

/// Translate a `[...]` class starting at `start`; returns the regex text and
/// the index of the closing `]`.
fn translate_class(chars: &[char], start: usize) -> Option<(String, usize)> {
  let mut j = start + 1;
  let negated = matches!(chars.get(j), Some('!') | Some('^'));
  if negated {
    j += 1;
  }

  let mut body = String::new();
  let mut first = true;
  while let Some(&c) = chars.get(j) {
    if c == ']' && !first {
      let class = if negated {
        format!("[^/{}]", body)
      } else {
        format!("[{}]", body)
      };
      return Some((class, j));
    }
    match c {
      '\\' | '[' | ']' | '^' | '&' | '~' => {
        body.push('\\');
        body.push(c);
      }
      _ => body.push(c),
    }
    first = false;
    j += 1;
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  fn matches(pattern: &str, path: &str) -> bool {
    Glob::new(pattern).unwrap().is_match(&RelPath::new(path).unwrap())
  }

  #[test]
  fn star_stays_within_segment() {
    assert!(matches("*.js", "x.js"));
    assert!(!matches("*.js", "a/x.js"));
    assert!(matches("a/*/c.js", "a/b/c.js"));
    assert!(!matches("a/*/c.js", "a/b/b/c.js"));
  }

  #[test]
  fn double_star_spans_directories() {
    assert!(matches("**/*.js", "x.js"));
    assert!(matches("**/*.js", "a/b/x.js"));
    assert!(matches("**/**", "anything/at/all.txt"));
    assert!(matches("**", "a/b"));
    assert!(matches("benchmarks/**", "benchmarks/src/index.html"));
    assert!(!matches("benchmarks/**", "benchmarks_external/src/index.html"));
    assert!(matches("angular2/typings/es6-*/**", "angular2/typings/es6-shim/es6-shim.d.ts"));
  }

  #[test]
  fn double_star_in_middle() {
    assert!(matches("*/src/**/*.html", "examples/src/index.html"));
    assert!(matches("*/src/**/*.html", "examples/src/hello/index.html"));
    assert!(!matches("*/src/**/*.html", "examples/test/index.html"));
    assert!(matches("examples*/**/web_workers/**/*.html", "examples/src/web_workers/todo/index.html"));
  }

  #[test]
  fn braces_expand_alternatives() {
    let glob = Glob::new("**/*.{html,ts,dart}").unwrap();
    for path in ["a/index.html", "b/c.ts", "main.dart"] {
      assert!(glob.is_match(&RelPath::new(path).unwrap()), "{path}");
    }
    assert!(!glob.is_match(&RelPath::new("a/b.js").unwrap()));
    assert!(matches("{es5,es6}/**", "es6/x.js"));
    assert!(matches("a{b,c{d,e}}", "ace"));
  }

  #[test]
  fn question_and_classes() {
    assert!(matches("file?.js", "file1.js"));
    assert!(!matches("file?.js", "file10.js"));
    assert!(matches("[abc].js", "b.js"));
    assert!(!matches("[!abc].js", "b.js"));
    assert!(matches("[!abc].js", "d.js"));
    assert!(matches("v[0-9].txt", "v7.txt"));
  }

  #[test]
  fn literal_regex_metacharacters_are_escaped() {
    assert!(matches("a+b(1).js", "a+b(1).js"));
    assert!(!matches("a.js", "abjs"));
    assert!(matches("\\*.js", "*.js"));
    assert!(!matches("\\*.js", "x.js"));
  }

  #[test]
  fn leading_slash_and_dot_slash_are_ignored() {
    assert!(matches("/tools/build/*.js", "tools/build/es5build.js"));
    assert!(matches("./tools/**", "tools/x"));
  }

  #[test]
  fn malformed_globs_are_rejected() {
    assert!(matches!(Glob::new("{a,b"), Err(GlobError::UnclosedBrace(_))));
    assert!(matches!(Glob::new("[abc"), Err(GlobError::UnclosedClass(_))));
  }

  #[test]
  fn set_matches_any_member() {
    let set = GlobSet::new(["**/*.cjs", "angular1_router/**"]).unwrap();
    assert!(set.is_match(&RelPath::new("a/b.cjs").unwrap()));
    assert!(set.is_match(&RelPath::new("angular1_router/x.js").unwrap()));
    assert!(!set.is_match(&RelPath::new("angular2/core.ts").unwrap()));
    assert!(!GlobSet::default().is_match(&RelPath::new("x").unwrap()));
    assert!(GlobSet::everything().is_match(&RelPath::new("deep/x/y").unwrap()));
  }

  #[test]
  fn set_serializes_as_pattern_list() {
    let set = GlobSet::new(["*.js", "**/*.ts"]).unwrap();
    assert_eq!(serde_json::to_string(&set).unwrap(), r#"["*.js","**/*.ts"]"#);
  }
}
