//! Implementation of the `arbor build` command.
//!
//! Runs one pass over the pipeline, writes every output directory whose root
//! succeeded and saves the cache.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use arbor_lib::cache::LockMode;
use arbor_lib::engine::CancelToken;
use arbor_lib::project::{BuildOptions, BuildSummary, Project};

use crate::output::{
  OutputFormat, format_bytes, format_duration, print_error, print_info, print_json, print_plan, print_stat,
  print_success, print_warnings, symbols,
};

pub fn cmd_build(file: &Path, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let mut project = Project::open(file, LockMode::Write, "build")
    .with_context(|| format!("Failed to open pipeline: {}", file.display()))?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let summary = rt
    .block_on(project.build(BuildOptions::default(), &CancelToken::new()))
    .context("Build failed")?;

  print_summary(&summary, start.elapsed(), output)?;
  ensure_success(&summary)
}

/// Print a build (or dry-run) summary in the requested format.
pub(crate) fn print_summary(summary: &BuildSummary, elapsed: Duration, output: OutputFormat) -> Result<()> {
  if output.is_json() {
    return print_json(summary);
  }

  print_warnings(&summary.report.warnings);
  for failure in &summary.report.failed {
    print_error(&format!("node '{}' failed: {}", failure.node, failure.error));
  }

  for out in &summary.outputs {
    let target = format!("{} {} {}", out.root, symbols::ARROW, out.dest.display());
    if let Some(reason) = &out.blocked {
      print_error(&format!("{target}: not written ({reason})"));
      continue;
    }
    match &out.report {
      Some(report) => print_success(&format!(
        "{target}: {} written, {} removed, {} unchanged",
        report.written, report.removed, report.unchanged
      )),
      None if out.plan.is_empty() => print_info(&format!("{target}: up to date")),
      None => {
        print_info(&format!(
          "{target}: {} to write, {} to remove",
          out.plan.writes(),
          out.plan.removed.len()
        ));
        print_plan(&out.plan);
      }
    }
  }

  let report = &summary.report;
  print_stat("Evaluated", &report.evaluated.len().to_string());
  print_stat("Cached", &report.cached.len().to_string());
  if !report.restored.is_empty() {
    print_stat("Restored", &report.restored.len().to_string());
  }
  if let Some(gc) = summary.gc.as_ref().filter(|gc| gc.objects_removed > 0) {
    print_stat("Objects swept", &gc.objects_removed.to_string());
    print_stat("Space freed", &format_bytes(gc.bytes_freed));
  }
  print_stat("Duration", &format_duration(elapsed));
  Ok(())
}

pub(crate) fn ensure_success(summary: &BuildSummary) -> Result<()> {
  if !summary.is_success() {
    bail!(
      "{} node(s) failed, {} skipped",
      summary.report.failed.len(),
      summary.report.skipped.len()
    );
  }
  Ok(())
}
