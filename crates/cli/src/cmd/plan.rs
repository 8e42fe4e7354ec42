//! Implementation of the `arbor plan` command.
//!
//! Runs a pass and shows what a build would write or remove. Nothing is
//! written, the cache included.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use arbor_lib::cache::LockMode;
use arbor_lib::engine::CancelToken;
use arbor_lib::project::{BuildOptions, Project};

use super::build::{ensure_success, print_summary};
use crate::output::OutputFormat;

pub fn cmd_plan(file: &Path, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let mut project = Project::open(file, LockMode::Read, "plan")
    .with_context(|| format!("Failed to open pipeline: {}", file.display()))?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let options = BuildOptions { dry_run: true };
  let summary = rt
    .block_on(project.build(options, &CancelToken::new()))
    .context("Plan failed")?;

  print_summary(&summary, start.elapsed(), output)?;
  ensure_success(&summary)
}
