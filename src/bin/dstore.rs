//! Storage node process.
//!
//! ```text
//! dstore <port> <controller_port> <timeout_ms> <storage_dir>
//! ```

use clap::Parser;
use replistore::cli::{exit_code, init_tracing, parse_args};
use replistore::{StoreConfig, StoreNode};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "dstore")]
#[command(about = "Storage node of the replicated file store")]
struct Args {
    /// Port to listen on for clients and peers. Identifies the node.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Port of the controller on this host.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    controller_port: u16,

    /// Upper bound for protocol waits, in milliseconds.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: u64,

    /// Directory for this node's files. Cleared at startup.
    storage_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let args: Args = parse_args();
    init_tracing();

    let config = StoreConfig::new(args.port, args.controller_port, args.storage_dir)
        .with_timeout(Duration::from_millis(args.timeout_ms));

    let node = match StoreNode::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "Failed to start storage node");
            std::process::exit(exit_code(&e));
        }
    };
    info!(port = node.port(), addr = %node.local_addr(), "Storage node running");

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!(error = %e, "Storage node stopped");
                std::process::exit(exit_code(&e));
            }
        }
        _ = tokio::signal::ctrl_c() => node.shutdown().await,
    }
}
