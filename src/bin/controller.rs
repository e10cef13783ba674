//! Controller process.
//!
//! ```text
//! controller <port> <replication_factor> <timeout_ms> <rebalance_period_s>
//! ```

use clap::Parser;
use replistore::cli::{exit_code, init_tracing, parse_args};
use replistore::{Controller, ControllerConfig};
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "controller")]
#[command(about = "Coordinating node of the replicated file store")]
struct Args {
    /// Port to listen on for clients and storage nodes.
    port: u16,

    /// Number of storage nodes holding each file.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    replication_factor: u64,

    /// Upper bound for protocol waits, in milliseconds.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: u64,

    /// Seconds between scheduled rebalances.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    rebalance_period_s: u64,
}

#[tokio::main]
async fn main() {
    let args: Args = parse_args();
    init_tracing();

    let config = ControllerConfig::new(args.port, args.replication_factor as usize)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_rebalance_period(Duration::from_secs(args.rebalance_period_s));

    let controller = match Controller::start(config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "Failed to start controller");
            std::process::exit(exit_code(&e));
        }
    };
    info!(addr = %controller.local_addr(), "Controller running");

    tokio::select! {
        _ = controller.run() => {}
        _ = tokio::signal::ctrl_c() => controller.shutdown(),
    }
}
