//! Executor service worker.
//!
//! Serves the executor protocol over TCP. Each session gets a local stack
//! built from the configuration.

use std::path::PathBuf;

use clap::Parser;
use fedra_runtime::{transport, ExecutorFactory, ExecutorServer, RuntimeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fedra-worker", about = "Serve a fedra executor over TCP")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "FEDRA_LISTEN", default_value = "127.0.0.1:7070")]
    listen: String,

    /// TOML runtime configuration.
    #[arg(long, env = "FEDRA_CONFIG")]
    config: Option<PathBuf>,

    /// Override `[local].max_fanout`.
    #[arg(long)]
    max_fanout: Option<usize>,

    /// Run each leaf executor on its own thread.
    #[arg(long)]
    thread_delegating: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(fanout) = args.max_fanout {
        config = config.with_max_fanout(fanout);
    }
    if args.thread_delegating {
        config = config.with_thread_delegating(true);
    }
    config.validate()?;
    // A worker always runs its sessions locally.
    config.remote.workers.clear();

    tracing::info!(
        max_fanout = config.local.max_fanout,
        caching = config.caching.enabled,
        pipeline = config.pipeline.enabled,
        "starting fedra worker"
    );
    let server = ExecutorServer::new(ExecutorFactory::from_config(config));
    transport::serve_tcp(server, args.listen.as_str()).await?;
    Ok(())
}
