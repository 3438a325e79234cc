//! 分散置換表のノードプロセス
//!
//! # 使用例
//!
//! 同一プロセスで4ノードをシミュレーション:
//! ```shell
//! cargo run -p shardtt-node --release -- simulate --nodes 4 --hash-mb 64 --threads 4
//! ```
//!
//! TCP で2ノード（それぞれ別のシェルで）:
//! ```shell
//! cargo run -p shardtt-node --release -- serve --config node.toml --rank 0
//! cargo run -p shardtt-node --release -- serve --config node.toml --rank 1
//! ```

mod config;
mod report;
mod serve;
mod simulate;
mod workload;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use config::{NodeConfig, Overrides};

#[derive(Parser, Debug)]
#[command(about = "distributed transposition table node", version)]
struct Cli {
    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Print the final statistics as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one node over TCP (addresses from the [node] table)
    Serve(CommonArgs),
    /// Run every node in this process over an in-memory fabric
    Simulate(CommonArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rank of this node
    #[arg(long)]
    rank: Option<usize>,

    /// Local transposition table size (MiB)
    #[arg(long)]
    hash_mb: Option<usize>,

    /// Search threads per node
    #[arg(long)]
    threads: Option<usize>,

    /// Number of nodes
    #[arg(long)]
    nodes: Option<usize>,
}

impl CommonArgs {
    fn load(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        config.apply(&Overrides {
            rank: self.rank,
            hash_mb: self.hash_mb,
            threads: self.threads,
            nodes: self.nodes,
        });
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    let result = match &cli.command {
        Command::Serve(args) => args.load().and_then(|config| serve::run(config, cli.json)),
        Command::Simulate(args) => args.load().and_then(|config| simulate::run(config, cli.json)),
    };
    if let Err(e) = &result {
        log::error!("{e:#}");
    }
    result
}
