//! Implementation of the `arbor watch` command.
//!
//! Rebuilds on a fixed interval until Ctrl-C. Each pass is incremental, so a
//! pass over an unchanged tree evaluates nothing and writes nothing. Ctrl-C
//! during a pass cancels it; a cancelled pass leaves the cache as it was.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use arbor_lib::cache::LockMode;
use arbor_lib::engine::{CancelToken, EngineError};
use arbor_lib::project::{BuildOptions, BuildSummary, Project, ProjectError};

use super::build::print_summary;
use crate::output::{OutputFormat, print_error, print_info};

pub fn cmd_watch(file: &Path, interval: Duration, output: OutputFormat) -> Result<()> {
  let mut project = Project::open(file, LockMode::Write, "watch")
    .with_context(|| format!("Failed to open pipeline: {}", file.display()))?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(watch(&mut project, interval, output))
}

async fn watch(project: &mut Project, interval: Duration, output: OutputFormat) -> Result<()> {
  if !output.is_json() {
    print_info(&format!(
      "Watching {} output(s), press Ctrl-C to stop",
      project.outputs().len()
    ));
  }

  let mut pass = 0u64;
  loop {
    pass += 1;
    let start = Instant::now();
    let cancel = CancelToken::new();

    let (result, interrupted) = {
      let build = project.build(BuildOptions::default(), &cancel);
      tokio::pin!(build);
      tokio::select! {
        result = &mut build => (result, false),
        _ = tokio::signal::ctrl_c() => {
          cancel.cancel();
          (build.await, true)
        }
      }
    };

    match result {
      Ok(summary) => report_pass(pass, &summary, start.elapsed(), output)?,
      Err(ProjectError::Engine(EngineError::Cancelled)) => info!(pass, "pass cancelled"),
      Err(e) => print_error(&format!("pass {pass} failed: {e}")),
    }
    if interrupted {
      break;
    }

    tokio::select! {
      _ = tokio::time::sleep(interval) => {}
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  if !output.is_json() {
    print_info("Stopped watching");
  }
  Ok(())
}

/// Passes that changed nothing stay quiet.
fn report_pass(pass: u64, summary: &BuildSummary, elapsed: Duration, output: OutputFormat) -> Result<()> {
  let written = summary
    .outputs
    .iter()
    .filter_map(|o| o.report.as_ref())
    .any(|r| r.written > 0 || r.removed > 0);
  let quiet = summary.report.evaluated.is_empty() && !written && summary.is_success();

  if pass > 1 && quiet {
    debug!(pass, "nothing changed");
    return Ok(());
  }
  print_summary(summary, elapsed, output)
}
