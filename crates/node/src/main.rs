//! Launcher entry point.
//!
//! Loads the topology, wires the tree over the in-process transport, and
//! drives the requested rounds from the root. Exit 0 on clean shutdown,
//! nonzero on fatal error (bad config, no round completed, broken
//! accountability chain).

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

mod cli;
mod launch;

use cli::Cli;

fn init_tracing(debug: bool) {
    let default_level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);
    launch::run(&args).await
}
