//! Implementation of the `arbor graph` command.
//!
//! Prints the nodes reachable from the outputs, grouped into the waves the
//! engine evaluates them in. Nodes in the same wave may run concurrently.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use arbor_lib::config::PipelineConfig;
use arbor_lib::graph::BuildGraph;
use arbor_lib::node::{FsScanner, NodeId};

use crate::output::{OutputFormat, print_json, symbols};

#[derive(Debug, Serialize)]
struct GraphView {
  roots: Vec<NodeId>,
  waves: Vec<Vec<NodeView>>,
}

#[derive(Debug, Serialize)]
struct NodeView {
  id: NodeId,
  kind: &'static str,
  inputs: Vec<NodeId>,
}

pub fn cmd_graph(file: &Path, output: OutputFormat) -> Result<()> {
  let config = PipelineConfig::load(file).with_context(|| format!("Failed to load pipeline: {}", file.display()))?;
  let graph = config
    .build_graph(Arc::new(FsScanner::new()))
    .context("Failed to build graph")?;
  let view = view(&graph)?;

  if output.is_json() {
    return print_json(&view);
  }

  for (index, wave) in view.waves.iter().enumerate() {
    println!("{}", format!("wave {index}").if_supports_color(Stream::Stdout, |s| s.bold()));
    for node in wave {
      let kind = format!("({})", node.kind);
      if node.inputs.is_empty() {
        println!("  {} {}", node.id, kind.if_supports_color(Stream::Stdout, |s| s.dimmed()));
      } else {
        let inputs = node.inputs.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ");
        println!(
          "  {} {} {} {}",
          inputs,
          symbols::ARROW,
          node.id,
          kind.if_supports_color(Stream::Stdout, |s| s.dimmed())
        );
      }
    }
  }
  Ok(())
}

fn view(graph: &BuildGraph) -> Result<GraphView> {
  let waves = graph.waves().context("Failed to order graph")?;
  let waves = waves
    .into_iter()
    .map(|wave| {
      wave
        .into_iter()
        .filter_map(|id| graph.node(&id))
        .map(|node| NodeView {
          id: node.id.clone(),
          kind: node.kind.tag(),
          inputs: node.inputs.clone(),
        })
        .collect()
    })
    .collect();

  Ok(GraphView {
    roots: graph.roots().to_vec(),
    waves,
  })
}
