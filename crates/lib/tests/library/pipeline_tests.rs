use std::sync::Arc;

use arbor_lib::engine::{CancelToken, Engine, EngineConfig, EngineError};
use arbor_lib::glob::GlobSet;
use arbor_lib::graph::{BuildGraph, GraphBuilder, GraphError};
use arbor_lib::materialize::{Materializer, OutputRecord};
use arbor_lib::node::{
  CompileConfig, CompileNode, CompileOutput, Compiler, CompilerFailure, FlattenNode, MemoryScanner, MergePolicy,
  NodeError, Pattern, SourceNode, SubstituteNode, Target,
};
use arbor_lib::store::EntryStore;

use super::common::{DownlevelCompiler, as_scanner, files_under, id, memory, paths, read, rel};

fn engine(graph: BuildGraph) -> Engine {
  Engine::new(Arc::new(graph), EngineConfig { parallelism: 4 })
}

#[tokio::test]
async fn compiled_tree_is_materialized_and_pruned() {
  let scanner = memory(&[("x.ts", "console.log(1)")]);
  let compiler = Arc::new(DownlevelCompiler::default());

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  builder
    .compile("es5", &src, CompileNode::new(CompileConfig::new(Target::Es5), compiler.clone()))
    .unwrap();
  let engine = engine(builder.build(["es5"]).unwrap());

  let temp = tempfile::tempdir().unwrap();
  let dest = temp.path().join("D");
  let mut materializer = Materializer::to_dir(&dest, OutputRecord::new());
  let cancel = CancelToken::new();

  let first = engine.run_pass(&cancel).await.unwrap();
  let report = materializer.materialize(first.output(&id("es5")).unwrap()).unwrap();
  assert_eq!(report.written, 1);
  assert_eq!(files_under(temp.path()), vec!["D/x.js"]);
  assert_eq!(std::fs::read_to_string(dest.join("x.js")).unwrap(), "console.log(1)");

  assert!(scanner.remove("x.ts"));
  let second = engine.run_pass(&cancel).await.unwrap();
  assert!(second.report.is_success());
  let report = materializer.materialize(second.output(&id("es5")).unwrap()).unwrap();
  assert_eq!(report.removed, 1);
  assert!(files_under(temp.path()).is_empty());
  assert_eq!(compiler.invocations(), 2);
}

#[tokio::test]
async fn relocated_output_lands_under_its_prefix() {
  let scanner = memory(&[("x.ts", "let x = 1;"), ("lib/y.ts", "const y = 2;")]);

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  let compile = CompileNode::new(CompileConfig::new(Target::Es5), Arc::new(DownlevelCompiler::default()));
  let es5 = builder.compile("es5", &src, compile).unwrap();
  builder.relocate("out", &es5, rel("es5")).unwrap();

  let out = engine(builder.build(["out"]).unwrap())
    .evaluate(&id("out"), &CancelToken::new())
    .await
    .unwrap();
  assert_eq!(paths(&out), vec!["es5/lib/y.js", "es5/x.js"]);
  assert_eq!(read(&out, "es5/lib/y.js"), "var y = 2;");
}

#[tokio::test]
async fn unchanged_pipeline_does_no_work() {
  let scanner = memory(&[("a.ts", "const a = 1;"), ("b.js", "b")]);
  let compiler = Arc::new(DownlevelCompiler::default());

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  let es5 = builder
    .compile("es5", &src, CompileNode::new(CompileConfig::new(Target::Es5), compiler.clone()))
    .unwrap();
  builder.merge("tree", &[es5, src], MergePolicy::FirstWins).unwrap();
  let engine = engine(builder.build(["tree"]).unwrap());

  let dest = tempfile::tempdir().unwrap();
  let mut materializer = Materializer::to_dir(dest.path(), OutputRecord::new());
  let cancel = CancelToken::new();

  let first = engine.run_pass(&cancel).await.unwrap();
  materializer.materialize(first.output(&id("tree")).unwrap()).unwrap();

  let second = engine.run_pass(&cancel).await.unwrap();
  assert!(second.report.evaluated.is_empty());
  assert_eq!(second.report.cached.len(), 3);
  let tree = second.output(&id("tree")).unwrap();
  assert_eq!(paths(tree), vec!["a.js", "a.ts", "b.js"]);
  assert!(materializer.plan(tree).is_empty());
  assert_eq!(compiler.invocations(), 1);
}

#[tokio::test]
async fn merge_policies_over_overlapping_sources() {
  let app = memory(&[("index.js", "app"), ("app.js", "a")]);
  let vendor = memory(&[("index.js", "vendor"), ("vendor.js", "v")]);

  let build = |policy: MergePolicy, app_first: bool| {
    let mut builder = GraphBuilder::new();
    let a = builder.source("app", SourceNode::new("app", as_scanner(&app))).unwrap();
    let v = builder.source("vendor", SourceNode::new("vendor", as_scanner(&vendor))).unwrap();
    let inputs = if app_first { [a, v] } else { [v, a] };
    builder.merge("tree", &inputs, policy).unwrap();
    engine(builder.build(["tree"]).unwrap())
  };
  let cancel = CancelToken::new();

  let first_wins = build(MergePolicy::FirstWins, true).run_pass(&cancel).await.unwrap();
  let tree = first_wins.output(&id("tree")).unwrap();
  assert_eq!(paths(tree), vec!["app.js", "index.js", "vendor.js"]);
  assert_eq!(read(tree, "index.js"), "app");

  let reordered = build(MergePolicy::FirstWins, false).run_pass(&cancel).await.unwrap();
  assert_eq!(read(reordered.output(&id("tree")).unwrap(), "index.js"), "vendor");

  let last_wins = build(MergePolicy::LastWins, true).run_pass(&cancel).await.unwrap();
  assert_eq!(read(last_wins.output(&id("tree")).unwrap(), "index.js"), "vendor");

  let strict = build(MergePolicy::Strict, true).run_pass(&cancel).await.unwrap();
  assert!(strict.output(&id("tree")).is_none());
  match strict.report.failure(&id("tree")) {
    Some(NodeError::MergeConflict { path, .. }) => assert_eq!(path, &rel("index.js")),
    other => panic!("expected a merge conflict, got {other:?}"),
  }
}

#[tokio::test]
async fn disjoint_strict_merge_is_the_union() {
  let app = memory(&[("app.js", "a")]);
  let vendor = memory(&[("lib/vendor.js", "v")]);

  let mut builder = GraphBuilder::new();
  let a = builder.source("app", SourceNode::new("app", as_scanner(&app))).unwrap();
  let v = builder.source("vendor", SourceNode::new("vendor", as_scanner(&vendor))).unwrap();
  builder.merge("tree", &[a, v], MergePolicy::Strict).unwrap();

  let result = engine(builder.build(["tree"]).unwrap()).run_pass(&CancelToken::new()).await.unwrap();
  assert_eq!(paths(result.output(&id("tree")).unwrap()), vec!["app.js", "lib/vendor.js"]);
}

#[tokio::test]
async fn flatten_collision_skips_dependents() {
  let scanner = memory(&[("a/index.js", "a"), ("b/index.js", "b")]);

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  let flat = builder.flatten("flat", &src, FlattenNode::new(Some(rel("bundle")))).unwrap();
  let stamped = SubstituteNode::new(GlobSet::everything(), vec![Pattern::literal("@@V", "1")]);
  builder.substitute("stamped", &flat, stamped).unwrap();

  let result = engine(builder.build(["stamped"]).unwrap())
    .run_pass(&CancelToken::new())
    .await
    .unwrap();
  assert!(matches!(
    result.report.failure(&id("flat")),
    Some(NodeError::PathCollision { .. })
  ));
  assert_eq!(result.report.skipped.get(&id("stamped")), Some(&id("flat")));
  assert_eq!(result.report.blocked_reason(&id("stamped")), "dependency 'flat' failed");

  assert!(scanner.remove("b/index.js"));
  let retry = flatten_alone(&scanner).await;
  assert_eq!(paths(&retry), vec!["bundle/index.js"]);
}

async fn flatten_alone(scanner: &Arc<MemoryScanner>) -> Arc<EntryStore> {
  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(scanner))).unwrap();
  builder.flatten("flat", &src, FlattenNode::new(Some(rel("bundle")))).unwrap();
  let engine = engine(builder.build(["flat"]).unwrap());
  engine.evaluate(&id("flat"), &CancelToken::new()).await.unwrap()
}

#[tokio::test]
async fn compile_errors_block_only_their_branch() {
  let scanner = memory(&[("bad.ts", "// @error nope\nlet x;"), ("style.css", "body {}")]);
  let compiler = Arc::new(DownlevelCompiler::default());
  let mut options = CompileConfig::new(Target::Es5);
  options.no_emit_on_error = true;

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  builder.compile("es5", &src, CompileNode::new(options, compiler)).unwrap();
  let engine = engine(builder.build(["es5", "src"]).unwrap());

  let result = engine.run_pass(&CancelToken::new()).await.unwrap();
  assert!(!result.report.is_success());
  assert!(matches!(result.report.failure(&id("es5")), Some(NodeError::Compile { .. })));
  assert!(result.output(&id("es5")).is_none());
  assert_eq!(paths(result.output(&id("src")).unwrap()), vec!["bad.ts", "style.css"]);

  let err = engine.evaluate(&id("es5"), &CancelToken::new()).await.unwrap_err();
  assert!(matches!(err, EngineError::NoOutput { .. }));
  assert!(err.to_string().contains("nope"));
}

#[tokio::test]
async fn warnings_are_reported_not_fatal() {
  let scanner = memory(&[("x.ts", "// @warn unused variable\nlet x;")]);

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  let compile = CompileNode::new(CompileConfig::new(Target::Es5), Arc::new(DownlevelCompiler::default()));
  builder.compile("es5", &src, compile).unwrap();
  let engine = engine(builder.build(["es5"]).unwrap());

  let result = engine.run_pass(&CancelToken::new()).await.unwrap();
  assert!(result.report.is_success());
  assert_eq!(result.report.warnings.len(), 1);
  assert_eq!(result.report.warnings[0].node, id("es5"));
  assert_eq!(result.report.warnings[0].diagnostic.message, "unused variable");
  assert_eq!(paths(result.output(&id("es5")).unwrap()), vec!["x.js"]);
}

#[tokio::test]
async fn cancelled_pass_leaves_cache_untouched() {
  let scanner = memory(&[("x.ts", "let x;")]);
  let compiler = Arc::new(DownlevelCompiler::default());

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  builder
    .compile("es5", &src, CompileNode::new(CompileConfig::new(Target::Es5), compiler.clone()))
    .unwrap();
  let engine = engine(builder.build(["es5"]).unwrap());

  let cancelled = CancelToken::new();
  cancelled.cancel();
  assert!(matches!(engine.run_pass(&cancelled).await, Err(EngineError::Cancelled)));
  assert_eq!(compiler.invocations(), 0);

  let result = engine.run_pass(&CancelToken::new()).await.unwrap();
  assert_eq!(result.report.evaluated.len(), 2);
}

/// Cancels `token` from inside its first compile, then compiles normally.
#[derive(Debug)]
struct CancellingCompiler {
  inner: DownlevelCompiler,
  token: CancelToken,
}

impl Compiler for CancellingCompiler {
  fn fingerprint(&self) -> String {
    self.inner.fingerprint()
  }

  fn compile(&self, entries: &EntryStore, config: &CompileConfig) -> Result<CompileOutput, CompilerFailure> {
    self.token.cancel();
    self.inner.compile(entries, config)
  }
}

#[tokio::test]
async fn cancelling_mid_pass_discards_finished_nodes() {
  let scanner = memory(&[("x.ts", "let x;")]);
  let cancel = CancelToken::new();
  let compiler = Arc::new(CancellingCompiler {
    inner: DownlevelCompiler::default(),
    token: cancel.clone(),
  });

  let mut builder = GraphBuilder::new();
  let src = builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  let es5 = builder
    .compile("es5", &src, CompileNode::new(CompileConfig::new(Target::Es5), compiler.clone()))
    .unwrap();
  builder.relocate("out", &es5, rel("es5")).unwrap();
  let engine = engine(builder.build(["out"]).unwrap());

  // src and es5 both finish before the pass notices the cancellation
  assert!(matches!(engine.run_pass(&cancel).await, Err(EngineError::Cancelled)));
  assert_eq!(compiler.inner.invocations(), 1);

  let result = engine.run_pass(&CancelToken::new()).await.unwrap();
  let mut evaluated = result.report.evaluated.clone();
  evaluated.sort();
  assert_eq!(evaluated, vec![id("es5"), id("out"), id("src")]);
  assert!(result.report.cached.is_empty());
  assert_eq!(compiler.inner.invocations(), 2);
}

#[test]
fn cyclic_graph_is_rejected_before_evaluation() {
  let scanner = memory(&[]);
  let mut builder = GraphBuilder::new();
  builder.source("src", SourceNode::new("app", as_scanner(&scanner))).unwrap();
  builder.merge("a", &[id("src"), id("b")], MergePolicy::Strict).unwrap();
  builder.merge("b", &[id("a")], MergePolicy::Strict).unwrap();

  assert!(matches!(builder.build(["a"]), Err(GraphError::Cycle(_))));
}
