//! Pass evaluation over a frozen build graph.
//!
//! A pass evaluates the requested nodes plus everything they depend on, in
//! topological waves. Nodes within a wave run concurrently on blocking
//! worker threads, bounded by a semaphore.
//!
//! Each node's output is memoized against its input fingerprint (params plus
//! the output fingerprints of its inputs, or the fresh scan for sources). A
//! node whose input fingerprint matches the cache is not re-evaluated; an
//! unchanged tree therefore costs one scan per source and nothing else.
//!
//! Cache updates are staged during the pass and committed once it ends. A
//! cancelled pass commits nothing. A failed node keeps its previous cache
//! entry, its dependents are skipped, and unrelated nodes still complete.
//! Passes on one engine are serialized.

mod types;

pub use types::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::graph::BuildGraph;
use crate::node::{Node, NodeError, NodeId, NodeKind};
use crate::store::EntryStore;
use crate::util::hash::Fingerprint;

#[derive(Default)]
struct EngineState {
  cache: HashMap<NodeId, CachedOutput>,
  /// Records loaded from a previous invocation, not yet superseded.
  seeds: BTreeMap<NodeId, NodeRecord>,
}

/// Evaluates passes over one build graph and owns its memo table.
pub struct Engine {
  graph: Arc<BuildGraph>,
  config: EngineConfig,
  archive: Option<Arc<dyn OutputArchive>>,
  state: Mutex<EngineState>,
}

/// Work handed to a blocking worker.
struct Job {
  node: Arc<Node>,
  inputs: Vec<CachedOutput>,
  previous: Option<CachedOutput>,
  seed: Option<NodeRecord>,
  archive: Option<Arc<dyn OutputArchive>>,
}

enum Outcome {
  Hit(CachedOutput),
  Restored(CachedOutput),
  Evaluated(CachedOutput),
  Cancelled,
}

impl Engine {
  pub fn new(graph: Arc<BuildGraph>, config: EngineConfig) -> Self {
    Self {
      graph,
      config,
      archive: None,
      state: Mutex::new(EngineState::default()),
    }
  }

  /// Seed the engine with records from a previous invocation.
  ///
  /// Persistent nodes whose recorded input fingerprint still matches are
  /// restored through `archive` instead of being re-evaluated. Records for
  /// nodes absent from the graph are dropped.
  pub fn with_archive(mut self, records: BTreeMap<NodeId, NodeRecord>, archive: Arc<dyn OutputArchive>) -> Self {
    let seeds = records
      .into_iter()
      .filter(|(id, _)| self.graph.node(id).is_some_and(|n| n.kind.is_persistent()))
      .collect();
    self.state.get_mut().seeds = seeds;
    self.archive = Some(archive);
    self
  }

  pub fn graph(&self) -> &Arc<BuildGraph> {
    &self.graph
  }

  /// Evaluate the graph's roots.
  pub async fn run_pass(&self, cancel: &CancelToken) -> Result<PassResult, EngineError> {
    let roots = self.graph.roots().to_vec();
    self.run(&roots, cancel).await
  }

  /// Evaluate one node and return its output.
  ///
  /// # Errors
  ///
  /// Besides pass-level errors, returns `NoOutput` when the node failed or
  /// was skipped because a dependency failed.
  pub async fn evaluate(&self, id: &NodeId, cancel: &CancelToken) -> Result<Arc<EntryStore>, EngineError> {
    let result = self.run(std::slice::from_ref(id), cancel).await?;
    if let Some(output) = result.output(id) {
      return Ok(output.clone());
    }
    Err(EngineError::NoOutput {
      node: id.clone(),
      reason: result.report.blocked_reason(id),
    })
  }

  /// Evaluate `targets` and everything they depend on.
  pub async fn run(&self, targets: &[NodeId], cancel: &CancelToken) -> Result<PassResult, EngineError> {
    for target in targets {
      if self.graph.node(target).is_none() {
        return Err(EngineError::UnknownNode(target.clone()));
      }
    }

    let mut state = self.state.lock().await;
    let dag = self.graph.dag();
    let closure = dag.ancestors(targets);
    let waves = dag.waves_within(&closure)?;
    info!(nodes = closure.len(), waves = waves.len(), "starting pass");

    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let mut report = PassReport::default();
    let mut current: HashMap<NodeId, CachedOutput> = HashMap::new();
    let mut staged: Vec<(NodeId, CachedOutput)> = Vec::new();
    let mut broken: HashSet<NodeId> = HashSet::new();

    for (wave_idx, wave) in waves.iter().enumerate() {
      if cancel.is_cancelled() {
        warn!(wave = wave_idx, "pass cancelled, discarding staged cache updates");
        return Err(EngineError::Cancelled);
      }
      debug!(wave = wave_idx, nodes = wave.len(), "evaluating wave");

      let mut jobs = Vec::with_capacity(wave.len());
      for id in wave {
        let node = self
          .graph
          .node(id)
          .cloned()
          .ok_or_else(|| EngineError::UnknownNode(id.clone()))?;

        if let Some(failed_dep) = node.inputs.iter().find(|input| broken.contains(*input)) {
          warn!(node = %id, failed_dep = %failed_dep, "skipping node due to failed dependency");
          report.skipped.insert(id.clone(), failed_dep.clone());
          broken.insert(id.clone());
          continue;
        }

        let inputs = node
          .inputs
          .iter()
          .map(|input| {
            current
              .get(input)
              .cloned()
              .ok_or_else(|| EngineError::UnknownNode(input.clone()))
          })
          .collect::<Result<Vec<_>, _>>()?;

        jobs.push(Job {
          previous: state.cache.get(id).cloned(),
          seed: state.seeds.get(id).cloned(),
          archive: self.archive.clone(),
          inputs,
          node,
        });
      }

      let mut cancelled = false;
      for (id, outcome) in run_wave(jobs, semaphore.clone(), cancel.clone()).await? {
        match outcome {
          Ok(Outcome::Hit(output)) => {
            debug!(node = %id, "cache hit");
            surface_warnings(&mut report, &id, &output);
            report.cached.push(id.clone());
            current.insert(id, output);
          }
          Ok(Outcome::Restored(output)) => {
            debug!(node = %id, "restored from archive");
            surface_warnings(&mut report, &id, &output);
            report.restored.push(id.clone());
            staged.push((id.clone(), output.clone()));
            current.insert(id, output);
          }
          Ok(Outcome::Evaluated(output)) => {
            debug!(node = %id, entries = output.store.len(), "evaluated");
            surface_warnings(&mut report, &id, &output);
            report.evaluated.push(id.clone());
            staged.push((id.clone(), output.clone()));
            current.insert(id, output);
          }
          Ok(Outcome::Cancelled) => cancelled = true,
          Err(e) => {
            error!(node = %id, error = %e, "node failed");
            broken.insert(id.clone());
            report.failed.push(NodeFailure { node: id, error: e });
          }
        }
      }

      if cancelled {
        warn!(wave = wave_idx, "pass cancelled, discarding staged cache updates");
        return Err(EngineError::Cancelled);
      }
    }

    if cancel.is_cancelled() {
      warn!("pass cancelled, discarding staged cache updates");
      return Err(EngineError::Cancelled);
    }

    for (id, output) in staged {
      state.seeds.remove(&id);
      state.cache.insert(id, output);
    }

    report.sort();
    info!(
      evaluated = report.evaluated.len(),
      cached = report.cached.len(),
      restored = report.restored.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      "pass complete"
    );

    let outputs = targets
      .iter()
      .filter_map(|id| current.get(id).map(|c| (id.clone(), c.store.clone())))
      .collect();
    Ok(PassResult { report, outputs })
  }

  /// Snapshot the memo table for persistence.
  ///
  /// Persistent nodes carry their entry fingerprints and, when evaluated in
  /// this session, their output for archiving. Seeds not touched by any pass
  /// are passed through unchanged.
  pub async fn export(&self) -> BTreeMap<NodeId, ExportedNode> {
    let state = self.state.lock().await;
    let mut exported: BTreeMap<NodeId, ExportedNode> = state
      .seeds
      .iter()
      .map(|(id, record)| {
        let node = ExportedNode {
          record: record.clone(),
          output: None,
        };
        (id.clone(), node)
      })
      .collect();

    for (id, cached) in &state.cache {
      let persistent = self.graph.node(id).is_some_and(|n| n.kind.is_persistent());
      let entries = persistent.then(|| {
        cached
          .store
          .iter()
          .map(|e| (e.path.clone(), e.fingerprint.clone()))
          .collect()
      });
      let record = NodeRecord {
        input_fingerprint: cached.input_fingerprint.clone(),
        output_fingerprint: cached.output_fingerprint.clone(),
        entries,
        diagnostics: cached.diagnostics.clone(),
      };
      let output = persistent.then(|| cached.store.clone());
      exported.insert(id.clone(), ExportedNode { record, output });
    }
    exported
  }
}

fn surface_warnings(report: &mut PassReport, id: &NodeId, output: &CachedOutput) {
  for diagnostic in &output.diagnostics {
    warn!(node = %id, diagnostic = %diagnostic, "node diagnostic");
    report.warnings.push(PassWarning {
      node: id.clone(),
      diagnostic: diagnostic.clone(),
    });
  }
}

/// Run one wave's jobs concurrently and collect their outcomes.
async fn run_wave(
  jobs: Vec<Job>,
  semaphore: Arc<Semaphore>,
  cancel: CancelToken,
) -> Result<Vec<(NodeId, Result<Outcome, NodeError>)>, EngineError> {
  let mut join_set = JoinSet::new();

  for job in jobs {
    let semaphore = semaphore.clone();
    let cancel = cancel.clone();
    join_set.spawn(async move {
      let id = job.node.id.clone();
      let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| EngineError::Join(e.to_string()))?;
      if cancel.is_cancelled() {
        return Ok((id, Ok(Outcome::Cancelled)));
      }
      let outcome = tokio::task::spawn_blocking(move || evaluate_job(job))
        .await
        .map_err(|e| EngineError::Join(format!("node '{id}': {e}")))?;
      Ok::<_, EngineError>((id, outcome))
    });
  }

  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(Ok(result)) => results.push(result),
      Ok(Err(e)) => return Err(e),
      Err(e) => {
        error!(error = %e, "node task panicked");
        return Err(EngineError::Join(e.to_string()));
      }
    }
  }
  Ok(results)
}

fn evaluate_job(job: Job) -> Result<Outcome, NodeError> {
  let Job {
    node,
    inputs,
    previous,
    seed,
    archive,
  } = job;

  if let NodeKind::Source(source) = &node.kind {
    let store = source.scan()?;
    let scanned = store.fingerprint();
    let input_fingerprint = node.input_fingerprint(&[&scanned]);
    if let Some(previous) = previous
      && previous.input_fingerprint == input_fingerprint
    {
      return Ok(Outcome::Hit(previous));
    }
    return Ok(Outcome::Evaluated(CachedOutput {
      input_fingerprint,
      output_fingerprint: scanned,
      store: Arc::new(store),
      diagnostics: Vec::new(),
    }));
  }

  let fingerprints: Vec<&Fingerprint> = inputs.iter().map(|i| &i.output_fingerprint).collect();
  let input_fingerprint = node.input_fingerprint(&fingerprints);

  if let Some(previous) = previous
    && previous.input_fingerprint == input_fingerprint
  {
    return Ok(Outcome::Hit(previous));
  }

  if let (Some(seed), Some(archive)) = (seed, archive)
    && seed.input_fingerprint == input_fingerprint
  {
    match archive.restore(&node.id, &seed) {
      Some(store) if store.fingerprint() == seed.output_fingerprint => {
        return Ok(Outcome::Restored(CachedOutput {
          input_fingerprint,
          output_fingerprint: seed.output_fingerprint,
          store: Arc::new(store),
          diagnostics: seed.diagnostics,
        }));
      }
      _ => debug!(node = %node.id, "archived output unavailable, re-evaluating"),
    }
  }

  let stores: Vec<Arc<EntryStore>> = inputs.iter().map(|i| i.store.clone()).collect();
  let output = node.evaluate(&stores)?;
  Ok(Outcome::Evaluated(CachedOutput {
    input_fingerprint,
    output_fingerprint: output.store.fingerprint(),
    store: Arc::new(output.store),
    diagnostics: output.diagnostics,
  }))
}
