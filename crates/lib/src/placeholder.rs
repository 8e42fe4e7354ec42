//! Placeholder parsing and substitution for path templates and command lines.
//!
//! Two places in a pipeline need values that are only known per entry or per
//! invocation:
//!
//! - substitute patterns whose replacement depends on the entry's path
//!   (e.g. the directory of the HTML file a script tag is injected into)
//! - compiler command lines that refer to the staged source and output
//!   directories
//!
//! # Placeholder Formats
//!
//! - `$${path}`: the entry's full relative path
//! - `$${dir}`: the entry's directory (empty for top-level entries)
//! - `$${name}`: the entry's file name
//! - `$${stem}`: the file name without its last extension
//! - `$${ext}`: the last extension, without the dot
//! - `$${src}`: staged source directory of a compiler invocation
//! - `$${out}`: output directory of a compiler invocation
//! - `$${files}`: the staged input files of a compiler invocation
//! - `$${config:<field>}`: a field of the compile configuration
//!
//! Single `$` characters pass through unchanged.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use arbor_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${dir}/$${stem}.js").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Dir),
//!     Segment::Literal("/".to_string()),
//!     Segment::Placeholder(Placeholder::Stem),
//!     Segment::Literal(".js".to_string()),
//! ]);
//! ```

use std::borrow::Cow;

use thiserror::Error;

use crate::path::RelPath;

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Path,
  Dir,
  Name,
  Stem,
  Ext,
  Src,
  Out,
  Files,
  /// `$${config:<field>}`
  Config(String),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A placeholder to be resolved
  Placeholder(Placeholder),
}

/// Errors that can occur during placeholder parsing or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("placeholder '{0}' is not available in this context")]
  Unsupported(String),

  #[error("unknown compile config field: {0}")]
  UnknownConfigField(String),
}

/// Resolves placeholder values for one substitution context.
pub trait Resolver {
  fn resolve(&self, placeholder: &Placeholder) -> Result<Cow<'_, str>, PlaceholderError>;
}

/// Resolves the path placeholders (`path`, `dir`, `name`, `stem`, `ext`) for one entry.
pub struct PathResolver<'a> {
  path: &'a RelPath,
}

impl<'a> PathResolver<'a> {
  pub fn new(path: &'a RelPath) -> Self {
    Self { path }
  }
}

impl Resolver for PathResolver<'_> {
  fn resolve(&self, placeholder: &Placeholder) -> Result<Cow<'_, str>, PlaceholderError> {
    let value = match placeholder {
      Placeholder::Path => self.path.as_str(),
      Placeholder::Dir => self.path.dir_str(),
      Placeholder::Name => self.path.file_name(),
      Placeholder::Stem => self.path.file_stem(),
      Placeholder::Ext => self.path.extension().unwrap_or(""),
      other => return Err(PlaceholderError::Unsupported(placeholder_name(other))),
    };
    Ok(Cow::Borrowed(value))
  }
}

/// The `$${...}` spelling of a placeholder, for error messages and fingerprints.
pub fn placeholder_name(placeholder: &Placeholder) -> String {
  match placeholder {
    Placeholder::Path => "path".to_string(),
    Placeholder::Dir => "dir".to_string(),
    Placeholder::Name => "name".to_string(),
    Placeholder::Stem => "stem".to_string(),
    Placeholder::Ext => "ext".to_string(),
    Placeholder::Src => "src".to_string(),
    Placeholder::Out => "out".to_string(),
    Placeholder::Files => "files".to_string(),
    Placeholder::Config(field) => format!("config:{field}"),
  }
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is malformed (unclosed, unknown type, etc.)
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next(); // consume the second $

        match chars.peek() {
          Some((_, '$')) => {
            chars.next(); // consume the third $

            match chars.peek() {
              Some((_, '{')) => {
                // Escaped: $$${ -> $${ (literal)
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
            }
          }
          Some((_, '{')) => {
            chars.next(); // consume the {

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut found_close = false;
            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              content.push(c);
            }

            if !found_close {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      // A lone $ is literal (regex anchors, shell variables)
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Parse the content inside a placeholder (everything between `{` and `}`).
fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  if let Some((kind, rest)) = content.split_once(':') {
    return match kind {
      "config" if !rest.is_empty() => Ok(Placeholder::Config(rest.to_string())),
      "config" => Err(PlaceholderError::Malformed(format!("missing config field in '{content}'"))),
      _ => Err(PlaceholderError::UnknownType(kind.to_string())),
    };
  }

  match content {
    "path" => Ok(Placeholder::Path),
    "dir" => Ok(Placeholder::Dir),
    "name" => Ok(Placeholder::Name),
    "stem" => Ok(Placeholder::Stem),
    "ext" => Ok(Placeholder::Ext),
    "src" => Ok(Placeholder::Src),
    "out" => Ok(Placeholder::Out),
    "files" => Ok(Placeholder::Files),
    "" => Err(PlaceholderError::Malformed("empty placeholder".to_string())),
    other => Err(PlaceholderError::UnknownType(other.to_string())),
  }
}

/// Substitute all placeholders in a string using the provided resolver.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
///
/// Use this when a template is parsed once and resolved many times, as
/// substitute patterns are (once per matching entry).
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => result.push_str(&resolver.resolve(p)?),
    }
  }

  Ok(result)
}

/// Check that every placeholder in `segments` is one the path resolver supports.
pub fn validate_path_template(segments: &[Segment]) -> Result<(), PlaceholderError> {
  for segment in segments {
    if let Segment::Placeholder(p) = segment
      && !matches!(
        p,
        Placeholder::Path | Placeholder::Dir | Placeholder::Name | Placeholder::Stem | Placeholder::Ext
      )
    {
      return Err(PlaceholderError::Unsupported(placeholder_name(p)));
    }
  }
  Ok(())
}
