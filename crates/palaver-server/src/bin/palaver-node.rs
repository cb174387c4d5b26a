//! Palaver server daemon entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use palaver_config::ConfigLoader;
use palaver_server::Server;

/// A replica of the Palaver fault-tolerant chat service.
#[derive(Debug, Parser)]
#[command(name = "palaver-node", version, about)]
struct Args {
    /// Path to the configuration file (defaults to ./palaver.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the node id from the configuration.
    #[arg(long)]
    node_id: Option<u64>,

    /// Override the listen address from the configuration.
    #[arg(long)]
    listen_addr: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_file(path);
    }
    let mut config = loader.load().context("loading configuration")?;

    // CLI overrides beat file and environment.
    if let Some(id) = args.node_id {
        config.node.id = id;
    }
    if let Some(addr) = args.listen_addr {
        config.node.listen_addr = addr;
    }
    config.validate().context("configuration rejected")?;

    let mut server = Server::new(config).context("starting server")?;
    server.run().context("server loop failed")?;
    Ok(())
}
