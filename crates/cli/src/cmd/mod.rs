mod build;
mod clean;
mod graph;
mod plan;
mod watch;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use graph::cmd_graph;
pub use plan::cmd_plan;
pub use watch::cmd_watch;
