mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use arbor_lib::consts::DEFAULT_PIPELINE_FILE;

use output::{OutputFormat, print_error};

/// arbor - incremental file-tree transformation pipelines
#[derive(Parser)]
#[command(name = "arbor")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run one pass and write every output directory
  Build {
    /// Path to the pipeline file
    #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
    config: PathBuf,
  },

  /// Show what a build would write or remove, without writing anything
  Plan {
    /// Path to the pipeline file
    #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
    config: PathBuf,
  },

  /// Rebuild repeatedly until interrupted
  Watch {
    /// Path to the pipeline file
    #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
    config: PathBuf,

    /// Pause between passes (e.g. 500ms, 2s)
    #[arg(short, long, default_value = "500ms", value_parser = humantime::parse_duration)]
    interval: Duration,
  },

  /// Print the nodes of the pipeline in evaluation order
  Graph {
    /// Path to the pipeline file
    #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
    config: PathBuf,
  },

  /// Remove everything arbor wrote to the output directories
  Clean {
    /// Path to the pipeline file
    #[arg(short, long, default_value = DEFAULT_PIPELINE_FILE)]
    config: PathBuf,

    /// Also delete the cache directory
    #[arg(long)]
    cache: bool,
  },
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build { config } => cmd::cmd_build(&config, cli.output),
    Commands::Plan { config } => cmd::cmd_plan(&config, cli.output),
    Commands::Watch { config, interval } => cmd::cmd_watch(&config, interval, cli.output),
    Commands::Graph { config } => cmd::cmd_graph(&config, cli.output),
    Commands::Clean { config, cache } => cmd::cmd_clean(&config, cache, cli.output),
  };

  if let Err(e) = result {
    print_error(&format!("{e:#}"));
    std::process::exit(1);
  }
}
