//! Implementation of the `arbor clean` command.
//!
//! Removes every file arbor recorded writing to the output directories.
//! Files it did not write are left alone. With `--cache`, the cache
//! directory is deleted as well.

use std::path::Path;

use anyhow::{Context, Result};

use arbor_lib::cache::LockMode;
use arbor_lib::project::Project;

use crate::output::{OutputFormat, print_json, print_stat, print_success};

pub fn cmd_clean(file: &Path, remove_cache: bool, output: OutputFormat) -> Result<()> {
  let project = Project::open(file, LockMode::Write, "clean")
    .with_context(|| format!("Failed to open pipeline: {}", file.display()))?;
  let cache_dir = project.cache().root().to_path_buf();

  let summary = project.clean(remove_cache).context("Clean failed")?;

  if output.is_json() {
    print_json(&summary)?;
  } else {
    print_success("Clean complete");
    print_stat("Files removed", &summary.files_removed.to_string());
    if summary.cache_removed {
      print_stat("Cache removed", &cache_dir.display().to_string());
    }
  }

  Ok(())
}
