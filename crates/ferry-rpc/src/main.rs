//! Ferry RPC - command-line peer for the Ferry JSON-RPC engine.
//!
//! `serve` runs a demo server over any registered transport and prints the
//! bound address as `RPC_ADDRESS=<url>` on stdout. `call` connects, invokes
//! one method and prints its JSON result.

mod client;
mod methods;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ferry_core::config::TransportConfig;
use ferry_core::TransportRegistry;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ferry-rpc")]
#[command(about = "Bidirectional JSON-RPC peer with function marshalling")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo methods until interrupted
    Serve {
        /// Address to listen on, e.g. tcp://127.0.0.1:0 or http://127.0.0.1:0/rpc
        #[arg(short, long, default_value = TransportConfig::DEFAULT_TCP_LISTEN_ADDRESS)]
        address: String,
    },
    /// Invoke one method and print its result
    Call {
        /// Address of the server
        #[arg(short, long)]
        address: String,

        /// Method name
        method: String,

        /// Parameters as JSON (an array, or a single value)
        params: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries only machine-readable output.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let registry = TransportRegistry::with_defaults();

    match args.command {
        Command::Serve { address } => {
            info!("Starting Ferry RPC server");
            let (server, bound) = server::start_server(&registry, &address).await?;

            // Print address for the parent process to read (intentional stdout)
            println!("RPC_ADDRESS={}", bound);

            // Wait for shutdown signal
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
            server.close().await;
        }
        Command::Call {
            address,
            method,
            params,
        } => {
            let result = client::call(&registry, &address, &method, params.as_deref()).await?;
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    Ok(())
}
