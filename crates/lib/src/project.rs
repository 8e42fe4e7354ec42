//! A pipeline bound to its cache: what the CLI commands drive.
//!
//! Opening a project takes the cache lock, parses the pipeline file, builds
//! the graph and seeds the engine from the cache. A build runs one pass,
//! materializes every output whose root succeeded, archives persistent node
//! outputs and saves the cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{Cache, CacheError, CacheLock, CacheLockError, CacheState, GcStats, LockMode, LockOwner, sweep_objects};
use crate::config::{ConfigError, OutputSpec, PipelineConfig};
use crate::engine::{CancelToken, Engine, EngineError, PassReport};
use crate::graph::BuildGraph;
use crate::materialize::{MaterializeError, MaterializePlan, MaterializeReport, Materializer, OutputRecord};
use crate::node::{FsScanner, NodeId, Scanner};
use crate::store::EntryStore;

#[derive(Debug, Error)]
pub enum ProjectError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Engine(#[from] EngineError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Lock(#[from] CacheLockError),

  #[error(transparent)]
  Materialize(#[from] MaterializeError),

  #[error("materialization task failed: {0}")]
  Join(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
  /// Plan every output but write nothing, cache included.
  pub dry_run: bool,
}

/// What happened to one `[[output]]`.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
  pub root: NodeId,
  pub dest: PathBuf,
  pub plan: MaterializePlan,
  /// `None` on dry runs and when the root produced no output.
  pub report: Option<MaterializeReport>,
  /// Why the root produced no output.
  pub blocked: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BuildSummary {
  pub report: PassReport,
  pub outputs: Vec<OutputSummary>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub gc: Option<GcStats>,
}

impl BuildSummary {
  pub fn is_success(&self) -> bool {
    self.report.is_success() && self.outputs.iter().all(|o| o.blocked.is_none())
  }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanSummary {
  pub files_removed: usize,
  pub cache_removed: bool,
}

pub struct Project {
  config: PipelineConfig,
  outputs: Vec<OutputSpec>,
  cache: Cache,
  engine: Engine,
  records: BTreeMap<String, OutputRecord>,
  _lock: CacheLock,
}

fn record_key(dest: &Path) -> String {
  dest.to_string_lossy().into_owned()
}

impl Project {
  /// Open the pipeline at `path`, reading sources from disk.
  pub fn open(path: &Path, mode: LockMode, command: &str) -> Result<Self, ProjectError> {
    Self::open_with_scanner(path, mode, command, Arc::new(FsScanner::new()))
  }

  pub fn open_with_scanner(
    path: &Path,
    mode: LockMode,
    command: &str,
    scanner: Arc<dyn Scanner>,
  ) -> Result<Self, ProjectError> {
    let config = PipelineConfig::load(path)?;
    let outputs = config.outputs()?;
    let graph = Arc::new(config.build_graph(scanner)?);

    let cache = Cache::new(config.cache_dir());
    let owner = LockOwner::current(command, path, outputs.iter().map(|o| o.dest.clone()).collect());
    let lock = cache.lock(mode, &owner)?;
    let state = cache.load()?;

    let archive = Arc::new(cache.objects().clone());
    let engine = Engine::new(graph, config.engine_config()).with_archive(state.nodes, archive);
    info!(
      pipeline = %path.display(),
      cache = %cache.root().display(),
      outputs = outputs.len(),
      "opened project"
    );

    Ok(Self {
      config,
      outputs,
      cache,
      engine,
      records: state.outputs,
      _lock: lock,
    })
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn graph(&self) -> &BuildGraph {
    self.engine.graph()
  }

  pub fn outputs(&self) -> &[OutputSpec] {
    &self.outputs
  }

  pub fn cache(&self) -> &Cache {
    &self.cache
  }

  /// Run one pass and bring every output directory up to date.
  ///
  /// Outputs whose root failed are left untouched. The cache is saved even
  /// when some nodes failed, since every committed result is valid.
  pub async fn build(&mut self, options: BuildOptions, cancel: &CancelToken) -> Result<BuildSummary, ProjectError> {
    let result = self.engine.run_pass(cancel).await?;
    let mut outputs = Vec::with_capacity(self.outputs.len());

    for spec in &self.outputs {
      let Some(store) = result.output(&spec.root) else {
        let blocked = result.report.blocked_reason(&spec.root);
        warn!(root = %spec.root, dest = %spec.dest.display(), reason = %blocked, "output not materialized");
        outputs.push(OutputSummary {
          root: spec.root.clone(),
          dest: spec.dest.clone(),
          plan: MaterializePlan::default(),
          report: None,
          blocked: Some(blocked),
        });
        continue;
      };

      let key = record_key(&spec.dest);
      let record = self.records.get(&key).cloned().unwrap_or_default();
      let (plan, report, record) = materialize(spec.dest.clone(), record, store.clone(), options.dry_run).await?;
      if let Some(record) = record {
        self.records.insert(key, record);
      }
      let report = match report.transpose() {
        Ok(report) => report,
        Err(err) => {
          // keep what was written before the failure so a later build can remove it
          self.persist().await?;
          return Err(err.into());
        }
      };
      outputs.push(OutputSummary {
        root: spec.root.clone(),
        dest: spec.dest.clone(),
        plan,
        report,
        blocked: None,
      });
    }

    let gc = if options.dry_run { None } else { Some(self.persist().await?) };
    Ok(BuildSummary {
      report: result.report,
      outputs,
      gc,
    })
  }

  /// Archive persistent outputs, save the cache state and sweep orphaned
  /// objects.
  async fn persist(&self) -> Result<GcStats, ProjectError> {
    let exported = self.engine.export().await;
    let objects = self.cache.objects();

    let mut nodes = BTreeMap::new();
    for (id, node) in exported {
      if let Some(output) = &node.output {
        objects.put_all(output)?;
      }
      nodes.insert(id, node.record);
    }

    let state = CacheState {
      nodes,
      outputs: self.records.clone(),
      ..CacheState::default()
    };
    self.cache.save(&state)?;
    Ok(sweep_objects(objects, &state, false)?)
  }

  /// Save the output records, leaving node records as they are on disk.
  fn save_records(&self) -> Result<(), ProjectError> {
    let mut state = self.cache.load()?;
    state.outputs = self.records.clone();
    self.cache.save(&state)?;
    Ok(())
  }

  /// Remove every file arbor recorded writing, and optionally the cache.
  pub fn clean(mut self, remove_cache: bool) -> Result<CleanSummary, ProjectError> {
    let mut summary = CleanSummary::default();
    let empty = EntryStore::new();

    let dests: Vec<String> = self.records.keys().cloned().collect();
    for dest in dests {
      let Some(record) = self.records.remove(&dest) else {
        continue;
      };
      let mut materializer = Materializer::to_dir(&dest, record);
      let result = materializer.materialize(&empty);
      let remaining = materializer.into_record();
      if !remaining.is_empty() {
        self.records.insert(dest, remaining);
      }
      match result {
        Ok(report) => summary.files_removed += report.removed,
        Err(err) => {
          self.save_records()?;
          return Err(err.into());
        }
      }
    }

    if remove_cache {
      let cache = self.cache.clone();
      drop(self);
      summary.cache_removed = cache.remove()?;
    } else {
      self.save_records()?;
    }

    info!(files = summary.files_removed, cache = summary.cache_removed, "cleaned");
    Ok(summary)
  }
}

type Materialized = (
  MaterializePlan,
  Option<Result<MaterializeReport, MaterializeError>>,
  Option<OutputRecord>,
);

/// Plan (and unless `dry_run`, apply) one output on a blocking thread.
///
/// The updated record is returned even when applying fails part way.
async fn materialize(
  dest: PathBuf,
  record: OutputRecord,
  store: Arc<EntryStore>,
  dry_run: bool,
) -> Result<Materialized, ProjectError> {
  tokio::task::spawn_blocking(move || {
    let mut materializer = Materializer::to_dir(dest, record);
    let plan = materializer.plan(&store);
    if dry_run {
      return (plan, None, None);
    }
    let report = materializer.apply(&store, &plan);
    (plan, Some(report), Some(materializer.into_record()))
  })
  .await
  .map_err(|e| ProjectError::Join(e.to_string()))
}
