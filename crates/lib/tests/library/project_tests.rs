use std::fs;
use std::path::{Path, PathBuf};

use arbor_lib::cache::LockMode;
use arbor_lib::engine::CancelToken;
use arbor_lib::project::{BuildOptions, Project, ProjectError};

use super::common::{files_under, id, rel};

const PIPELINE: &str = r#"
[settings]
cache_dir = ".cache"
parallelism = 2

[[output]]
root = "scripts"
dest = "dist"

[nodes.src]
kind = "source"
root = "src"

[nodes.scripts]
kind = "filter"
input = "src"
include = ["**/*.js"]
dest_dir = "lib"
"#;

fn workspace(pipeline: &str, files: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
  let temp = tempfile::tempdir().unwrap();
  let pipeline_path = temp.path().join("arbor.toml");
  fs::write(&pipeline_path, pipeline).unwrap();
  for (path, content) in files {
    write(temp.path(), path, content);
  }
  (temp, pipeline_path)
}

fn write(root: &Path, path: &str, content: &str) {
  let target = root.join(path);
  fs::create_dir_all(target.parent().unwrap()).unwrap();
  fs::write(target, content).unwrap();
}

async fn build(pipeline: &Path, dry_run: bool) -> arbor_lib::project::BuildSummary {
  let mut project = Project::open(pipeline, LockMode::Write, "test").unwrap();
  project
    .build(BuildOptions { dry_run }, &CancelToken::new())
    .await
    .unwrap()
}

#[tokio::test]
async fn build_tracks_edits_across_invocations() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a"), ("src/b/b.js", "b"), ("src/notes.md", "n")]);
  let dist = temp.path().join("dist");

  let first = build(&pipeline, false).await;
  assert!(first.is_success());
  assert_eq!(first.outputs[0].report.as_ref().unwrap().written, 2);
  assert_eq!(files_under(&dist), vec!["lib/a.js", "lib/b/b.js"]);
  assert!(temp.path().join(".cache/state.json").exists());

  write(temp.path(), "src/a.js", "a2");
  let second = build(&pipeline, false).await;
  let report = second.outputs[0].report.as_ref().unwrap();
  assert_eq!((report.written, report.unchanged), (1, 1));
  assert_eq!(fs::read_to_string(dist.join("lib/a.js")).unwrap(), "a2");

  fs::remove_file(temp.path().join("src/b/b.js")).unwrap();
  let third = build(&pipeline, false).await;
  assert_eq!(third.outputs[0].report.as_ref().unwrap().removed, 1);
  assert_eq!(files_under(&dist), vec!["lib/a.js"]);
}

#[tokio::test]
async fn dry_run_plans_without_writing() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a")]);
  build(&pipeline, false).await;

  write(temp.path(), "src/a.js", "edited");
  write(temp.path(), "src/c.js", "c");
  let plan = build(&pipeline, true).await;
  let output = &plan.outputs[0];
  assert!(output.report.is_none());
  assert!(plan.gc.is_none());
  assert_eq!(output.plan.added, vec![rel("lib/c.js")]);
  assert_eq!(output.plan.updated, vec![rel("lib/a.js")]);
  assert_eq!(fs::read_to_string(temp.path().join("dist/lib/a.js")).unwrap(), "a");
  assert!(!temp.path().join("dist/lib/c.js").exists());

  // the dry run left the record alone, so the real build still sees both changes
  let real = build(&pipeline, false).await;
  assert_eq!(real.outputs[0].report.as_ref().unwrap().written, 2);
}

#[tokio::test]
async fn failed_root_leaves_destination_untouched() {
  let pipeline = r#"
[[output]]
root = "flat"
dest = "dist"

[nodes.src]
kind = "source"
root = "src"

[nodes.flat]
kind = "flatten"
input = "src"
"#;
  let (temp, pipeline) = workspace(pipeline, &[("src/a/index.js", "a")]);
  build(&pipeline, false).await;
  assert_eq!(files_under(&temp.path().join("dist")), vec!["index.js"]);

  write(temp.path(), "src/b/index.js", "b");
  let summary = build(&pipeline, false).await;
  assert!(!summary.is_success());
  let output = &summary.outputs[0];
  assert!(output.blocked.as_deref().unwrap().contains("path collision"));
  assert!(output.report.is_none());
  assert_eq!(fs::read_to_string(temp.path().join("dist/index.js")).unwrap(), "a");
}

#[tokio::test]
async fn failed_write_still_records_what_was_written() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a"), ("src/b.js", "b")]);
  // a foreign directory where `lib/b.js` should go
  write(temp.path(), "dist/lib/b.js/keep.txt", "not ours");

  let mut project = Project::open(&pipeline, LockMode::Write, "test").unwrap();
  let result = project.build(BuildOptions::default(), &CancelToken::new()).await;
  assert!(matches!(result, Err(ProjectError::Materialize(_))));
  drop(project);
  assert!(temp.path().join("dist/lib/a.js").exists());

  fs::remove_dir_all(temp.path().join("dist/lib/b.js")).unwrap();
  fs::remove_file(temp.path().join("src/a.js")).unwrap();
  let summary = build(&pipeline, false).await;
  let report = summary.outputs[0].report.as_ref().unwrap();
  assert_eq!((report.written, report.removed), (1, 1));
  assert_eq!(files_under(&temp.path().join("dist")), vec!["lib/b.js"]);
}

#[tokio::test]
async fn clean_removes_recorded_files_and_cache() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a"), ("src/b/b.js", "b")]);
  build(&pipeline, false).await;
  write(temp.path(), "dist/keep.txt", "not ours");

  let project = Project::open(&pipeline, LockMode::Write, "clean").unwrap();
  let summary = project.clean(true).unwrap();
  assert_eq!(summary.files_removed, 2);
  assert!(summary.cache_removed);
  assert_eq!(files_under(&temp.path().join("dist")), vec!["keep.txt"]);
  assert!(!temp.path().join(".cache").exists());
}

#[tokio::test]
async fn clean_without_cache_forgets_outputs() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a")]);
  build(&pipeline, false).await;

  let project = Project::open(&pipeline, LockMode::Write, "clean").unwrap();
  let summary = project.clean(false).unwrap();
  assert_eq!(summary.files_removed, 1);
  assert!(!summary.cache_removed);
  assert!(temp.path().join(".cache/state.json").exists());

  let rebuilt = build(&pipeline, false).await;
  assert_eq!(rebuilt.outputs[0].report.as_ref().unwrap().written, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn failed_clean_keeps_the_remaining_record() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a"), ("src/b/b.js", "b")]);
  build(&pipeline, false).await;
  fs::remove_file(temp.path().join("dist/lib/a.js")).unwrap();
  write(temp.path(), "dist/lib/a.js/keep.txt", "not ours");

  let project = Project::open(&pipeline, LockMode::Write, "clean").unwrap();
  assert!(matches!(project.clean(false), Err(ProjectError::Materialize(_))));

  fs::remove_dir_all(temp.path().join("dist/lib/a.js")).unwrap();
  let project = Project::open(&pipeline, LockMode::Write, "clean").unwrap();
  assert_eq!(project.clean(false).unwrap().files_removed, 2);
  assert!(files_under(&temp.path().join("dist")).is_empty());
}

#[tokio::test]
async fn graph_is_available_without_building() {
  let (_temp, pipeline) = workspace(PIPELINE, &[]);
  let project = Project::open(&pipeline, LockMode::Read, "graph").unwrap();
  assert_eq!(project.graph().roots(), &[id("scripts")]);
  assert_eq!(project.graph().waves().unwrap(), vec![vec![id("src")], vec![id("scripts")]]);
  assert_eq!(project.outputs().len(), 1);
}

#[test]
fn missing_pipeline_is_a_config_error() {
  let temp = tempfile::tempdir().unwrap();
  let result = Project::open(&temp.path().join("arbor.toml"), LockMode::Read, "plan");
  assert!(matches!(result, Err(ProjectError::Config(_))));
}

#[cfg(unix)]
#[test]
fn write_lock_blocks_a_second_project() {
  let (_temp, pipeline) = workspace(PIPELINE, &[]);
  let _held = Project::open(&pipeline, LockMode::Write, "build").unwrap();
  let Err(err) = Project::open(&pipeline, LockMode::Read, "plan") else {
    panic!("second project opened while the cache was locked");
  };
  assert!(matches!(err, ProjectError::Lock(_)));
  assert!(err.to_string().contains("`arbor build`"));
  assert!(err.to_string().contains("arbor.toml"));
}

#[tokio::test]
async fn read_only_open_leaves_no_cache_behind() {
  let (temp, pipeline) = workspace(PIPELINE, &[("src/a.js", "a")]);
  let mut project = Project::open(&pipeline, LockMode::Read, "plan").unwrap();
  let summary = project
    .build(BuildOptions { dry_run: true }, &CancelToken::new())
    .await
    .unwrap();
  assert_eq!(summary.outputs[0].plan.added, vec![rel("lib/a.js")]);
  assert!(!temp.path().join(".cache").exists());
}

#[cfg(unix)]
mod compile {
  use super::*;

  /// Copies each staged `.ts` file to `$out/<stem>.js`, logging every run.
  const COMPILED: &str = r#"
[settings]
cache_dir = ".cache"

[[output]]
root = "es5"
dest = "dist"

[nodes.src]
kind = "source"
root = "src"

[nodes.es5]
kind = "compile"
input = "src"
options = { target = "es5" }

[nodes.es5.command]
program = "/bin/sh"
args = ["-c", 'echo run >> "$LOG"; OUT="$1"; shift; for f in "$@"; do cp "$f" "$OUT/$(basename "$f" .ts).js"; done', "sh", "$${out}", "$${files}"]
env = { LOG = "@LOG@" }
"#;

  fn runs(log: &Path) -> usize {
    fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
  }

  #[tokio::test]
  async fn compiled_output_is_restored_from_the_cache() {
    let temp = tempfile::tempdir().unwrap();
    let log = temp.path().join("compiler.log");
    let pipeline = COMPILED.replace("@LOG@", &log.display().to_string());
    let (work, pipeline) = workspace(&pipeline, &[("src/x.ts", "let x = 1;")]);

    let first = build(&pipeline, false).await;
    assert!(first.is_success());
    assert_eq!(runs(&log), 1);
    assert_eq!(files_under(&work.path().join("dist")), vec!["x.js"]);

    let second = build(&pipeline, false).await;
    assert_eq!(second.report.restored, vec![id("es5")]);
    assert!(!second.report.was_evaluated(&id("es5")));
    assert_eq!(second.outputs[0].report.as_ref().unwrap().unchanged, 1);
    assert_eq!(runs(&log), 1);

    write(work.path(), "src/x.ts", "let x = 2;");
    let third = build(&pipeline, false).await;
    assert!(third.report.was_evaluated(&id("es5")));
    assert_eq!(runs(&log), 2);
    assert_eq!(third.gc.as_ref().unwrap().objects_removed, 1);
    assert_eq!(fs::read_to_string(work.path().join("dist/x.js")).unwrap(), "let x = 2;");
  }
}
