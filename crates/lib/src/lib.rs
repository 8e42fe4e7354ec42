//! arbor-lib: lazy, incremental virtual file-tree transformations
//!
//! This crate provides the pipeline model and its evaluation:
//! - `EntryStore`: an ordered set of `(path, content)` entries
//! - `node`: pure transformations (source, filter, substitute, flatten,
//!   compile, merge) from input stores to an output store
//! - `graph`: validated, acyclic graphs of nodes
//! - `engine`: memoized, cancellable passes over a graph
//! - `materialize`: writing a store to a directory incrementally
//! - `project`: a pipeline file bound to its on-disk cache

pub mod cache;
pub mod config;
pub mod consts;
pub mod engine;
pub mod glob;
pub mod graph;
pub mod materialize;
pub mod node;
pub mod path;
pub mod placeholder;
pub mod project;
pub mod store;
pub mod util;
