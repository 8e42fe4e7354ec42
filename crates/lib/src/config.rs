//! Pipeline configuration (`arbor.toml`).
//!
//! ```toml
//! [settings]
//! cache_dir = ".arbor"
//! parallelism = 4
//!
//! [[output]]
//! root = "tree"
//! dest = "dist"
//!
//! [nodes.src]
//! kind = "source"
//! root = "modules"
//! exclude = ["**/*.md"]
//!
//! [nodes.es5]
//! kind = "compile"
//! input = "src"
//! options = { target = "es5", module = "commonjs" }
//! command = { program = "tsc", args = ["--outDir", "$${out}", "$${files}"] }
//!
//! [nodes.tree]
//! kind = "merge"
//! inputs = ["es5", "src"]
//! policy = "first-wins"
//! ```
//!
//! Relative paths resolve against the directory holding the pipeline file.
//!
//! A substitute `regex` may not match empty text at the end of the content
//! (`$`, `\s*`): the replacement would be inserted again on every pass. Use
//! `end = true` to append.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::consts::{CACHE_DIR_ENV, DEFAULT_CACHE_DIR};
use crate::engine::EngineConfig;
use crate::glob::GlobSet;
use crate::graph::{BuildGraph, GraphBuilder, GraphError};
use crate::node::{
  CommandCompiler, CommandSpec, CompileConfig, CompileNode, FilterNode, FlattenNode, Matcher, MergeNode, MergePolicy,
  NodeId, NodeKind, Pattern, Replacement, Scanner, SourceNode, SubstituteNode, Template,
};
use crate::path::RelPath;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read {}: {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {}: {source}", .path.display())]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("the pipeline declares no [[output]]")]
  NoOutputs,

  #[error("output destination {} is declared twice", .0.display())]
  DuplicateDest(PathBuf),

  #[error(transparent)]
  Graph(#[from] GraphError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
  #[serde(default)]
  pub cache_dir: Option<PathBuf>,
  #[serde(default)]
  pub parallelism: Option<usize>,
}

/// A node whose output is written to a directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
  pub root: NodeId,
  pub dest: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatternConfig {
  #[serde(default)]
  pub literal: Option<String>,
  #[serde(default)]
  pub regex: Option<String>,
  /// Append at the end of the content instead of matching.
  #[serde(default)]
  pub end: bool,
  #[serde(default)]
  pub replacement: Option<String>,
  /// A `$${...}` path template rendered per entry.
  #[serde(default)]
  pub template: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum NodeConfig {
  Source {
    root: PathBuf,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
  },
  Filter {
    input: NodeId,
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
    #[serde(default)]
    src_dir: Option<String>,
    #[serde(default)]
    dest_dir: Option<String>,
  },
  Substitute {
    input: NodeId,
    #[serde(default)]
    files: Vec<String>,
    patterns: Vec<PatternConfig>,
  },
  Flatten {
    input: NodeId,
    #[serde(default)]
    dest_dir: Option<String>,
  },
  Compile {
    input: NodeId,
    options: CompileConfig,
    command: CommandSpec,
  },
  Merge {
    inputs: Vec<NodeId>,
    policy: MergePolicy,
  },
}

/// A parsed pipeline file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
  #[serde(default)]
  pub settings: Settings,
  #[serde(default, rename = "output")]
  pub outputs: Vec<OutputConfig>,
  #[serde(default)]
  pub nodes: BTreeMap<NodeId, NodeConfig>,
  #[serde(skip)]
  base_dir: PathBuf,
}

/// A resolved `[[output]]`: which node goes to which directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
  pub root: NodeId,
  pub dest: PathBuf,
}

impl PipelineConfig {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content, path)
  }

  /// Parse pipeline text as if read from `path`.
  pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
    let mut config: PipelineConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source: Box::new(source),
    })?;
    let parent = path.parent().unwrap_or(Path::new("."));
    config.base_dir = dunce::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
    debug!(
      path = %path.display(),
      nodes = config.nodes.len(),
      outputs = config.outputs.len(),
      "parsed pipeline"
    );
    Ok(config)
  }

  pub fn base_dir(&self) -> &Path {
    &self.base_dir
  }

  fn resolve(&self, path: &Path) -> PathBuf {
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.base_dir.join(path)
    }
  }

  /// Cache location: `ARBOR_CACHE_DIR`, then `settings.cache_dir`, then
  /// `.arbor` next to the pipeline file.
  pub fn cache_dir(&self) -> PathBuf {
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
      return PathBuf::from(dir);
    }
    match &self.settings.cache_dir {
      Some(dir) => self.resolve(dir),
      None => self.base_dir.join(DEFAULT_CACHE_DIR),
    }
  }

  pub fn engine_config(&self) -> EngineConfig {
    match self.settings.parallelism {
      Some(parallelism) => EngineConfig {
        parallelism: parallelism.max(1),
      },
      None => EngineConfig::default(),
    }
  }

  /// The outputs with destinations resolved.
  pub fn outputs(&self) -> Result<Vec<OutputSpec>, ConfigError> {
    if self.outputs.is_empty() {
      return Err(ConfigError::NoOutputs);
    }
    let mut seen = BTreeSet::new();
    let mut specs = Vec::with_capacity(self.outputs.len());
    for output in &self.outputs {
      let dest = self.resolve(&output.dest);
      if !seen.insert(dest.clone()) {
        return Err(ConfigError::DuplicateDest(dest));
      }
      specs.push(OutputSpec {
        root: output.root.clone(),
        dest,
      });
    }
    Ok(specs)
  }

  /// Build the graph reachable from the outputs, with every source node
  /// reading through `scanner`.
  pub fn build_graph(&self, scanner: Arc<dyn Scanner>) -> Result<BuildGraph, ConfigError> {
    let outputs = self.outputs()?;
    let mut builder = GraphBuilder::new();
    for (id, node) in &self.nodes {
      let (kind, inputs) = self.node_kind(id, node, &scanner)?;
      builder.add(id.clone(), kind, inputs)?;
    }
    let roots: BTreeSet<NodeId> = outputs.into_iter().map(|o| o.root).collect();
    Ok(builder.build(roots)?)
  }

  fn node_kind(
    &self,
    id: &NodeId,
    node: &NodeConfig,
    scanner: &Arc<dyn Scanner>,
  ) -> Result<(NodeKind, Vec<NodeId>), GraphError> {
    let invalid = |message: String| GraphError::InvalidParams {
      node: id.clone(),
      message,
    };

    Ok(match node {
      NodeConfig::Source { root, include, exclude } => {
        let mut source = SourceNode::new(self.resolve(root), scanner.clone()).exclude(globs(id, exclude)?);
        if !include.is_empty() {
          source = source.include(globs(id, include)?);
        }
        (NodeKind::Source(source), Vec::new())
      }
      NodeConfig::Filter {
        input,
        include,
        files,
        exclude,
        src_dir,
        dest_dir,
      } => {
        let mut filter = FilterNode::new()
          .exclude(globs(id, exclude)?)
          .src_dir(prefix(id, src_dir.as_deref())?)
          .dest_dir(prefix(id, dest_dir.as_deref())?);
        match (include.is_empty(), files.is_empty()) {
          (false, false) => return Err(invalid("`include` and `files` are mutually exclusive".to_string())),
          (false, true) => filter = filter.include(globs(id, include)?),
          (true, false) => {
            let files = files
              .iter()
              .map(|f| RelPath::new(f))
              .collect::<Result<Vec<_>, _>>()
              .map_err(|source| GraphError::Path {
                node: id.clone(),
                source,
              })?;
            filter = filter.files(files);
          }
          (true, true) => {}
        }
        (NodeKind::Filter(filter), vec![input.clone()])
      }
      NodeConfig::Substitute { input, files, patterns } => {
        let files = if files.is_empty() {
          GlobSet::everything()
        } else {
          globs(id, files)?
        };
        let patterns = patterns
          .iter()
          .map(|p| p.to_pattern().map_err(&invalid))
          .collect::<Result<Vec<_>, _>>()?;
        (
          NodeKind::Substitute(SubstituteNode::new(files, patterns)),
          vec![input.clone()],
        )
      }
      NodeConfig::Flatten { input, dest_dir } => {
        (NodeKind::Flatten(FlattenNode::new(prefix(id, dest_dir.as_deref())?)), vec![input.clone()])
      }
      NodeConfig::Compile { input, options, command } => {
        let mut command = command.clone();
        if command.program.contains(['/', '\\']) {
          command.program = self.resolve(Path::new(&command.program)).to_string_lossy().into_owned();
        }
        let compiler = CommandCompiler::new(command).map_err(|e| invalid(e.to_string()))?;
        (
          NodeKind::Compile(CompileNode::new(options.clone(), Arc::new(compiler))),
          vec![input.clone()],
        )
      }
      NodeConfig::Merge { inputs, policy } => (NodeKind::Merge(MergeNode::new(*policy)), inputs.clone()),
    })
  }
}

fn globs(node: &NodeId, patterns: &[String]) -> Result<GlobSet, GraphError> {
  GlobSet::new(patterns).map_err(|source| GraphError::Glob {
    node: node.clone(),
    source,
  })
}

fn prefix(node: &NodeId, raw: Option<&str>) -> Result<Option<RelPath>, GraphError> {
  match raw {
    Some(raw) => RelPath::parse_prefix(raw).map_err(|source| GraphError::Path {
      node: node.clone(),
      source,
    }),
    None => Ok(None),
  }
}

fn matches_empty_at_end(regex: &Regex) -> bool {
  ["", "a", " ", "\n"]
    .iter()
    .any(|text| regex.find_at(text, text.len()).is_some_and(|m| m.is_empty()))
}

impl PatternConfig {
  fn to_pattern(&self) -> Result<Pattern, String> {
    let matcher = match (&self.literal, &self.regex, self.end) {
      (Some(literal), None, false) => Matcher::Literal(literal.clone()),
      (None, Some(regex), false) => {
        let regex = Regex::new(regex).map_err(|e| e.to_string())?;
        if matches_empty_at_end(&regex) {
          return Err(format!(
            "regex `{regex}` can match empty text at the end of a file and would insert again on every pass; \
             use `end = true` to append"
          ));
        }
        Matcher::Regex(regex)
      }
      (None, None, true) => Matcher::End,
      _ => return Err("a pattern needs exactly one of `literal`, `regex` or `end`".to_string()),
    };
    let replacement = match (&self.replacement, &self.template) {
      (Some(text), None) => Replacement::Literal(text.clone()),
      (None, Some(template)) => Replacement::Template(Template::parse(template).map_err(|e| e.to_string())?),
      _ => return Err("a pattern needs exactly one of `replacement` or `template`".to_string()),
    };
    Ok(Pattern::new(matcher, replacement))
  }
}
