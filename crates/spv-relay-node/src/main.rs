//! SPV relay node: a single-writer header relay with a REST front end and
//! SQLite persistence.

use std::path::PathBuf;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use clap::{command, Parser};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, subscriber::set_global_default};
use tracing_subscriber::filter::EnvFilter;

use spv_relay::{FeeParams, NetworkParams};

use crate::{
    app::{create_app, AppConfig, BootstrapConfig},
    rpc::{RpcConfig, RpcServer},
};

mod app;
mod rpc;
mod store;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// RPC server host
    #[arg(long, default_value = "127.0.0.1:5000")]
    rpc_host: String,
    /// Path to the relay database
    #[arg(long, default_value = "./.relay_data/relay.db")]
    db_path: PathBuf,
    /// Genesis header, hex encoded (required for a fresh database)
    #[arg(long, requires = "period_start_hash")]
    genesis_header: Option<String>,
    /// Height of the genesis header
    #[arg(long, default_value = "0")]
    genesis_height: u64,
    /// Hash of the first block of the genesis difficulty period.
    /// Pass the genesis hash itself when genesis opens a period.
    #[arg(long)]
    period_start_hash: Option<String>,
    /// Confirmation depth required before a block is finalized
    #[arg(long, default_value = "6")]
    finalization_parameter: u64,
    /// Estimated header submission cost, in native units
    #[arg(long, default_value = "100000")]
    submission_cost: u64,
    /// Expected inclusion queries per fee epoch
    #[arg(long, default_value = "100")]
    baseline_queries: u64,
    /// Relayer markup on the submission cost, in percent
    #[arg(long, default_value = "15")]
    relayer_fee_pct: u64,
    /// Bearer token authorizing the owner endpoints
    #[arg(long, env = "OWNER_TOKEN")]
    owner_token: Option<String>,
    /// Logging level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber_builder =
        tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env_filter);

    let subscriber = subscriber_builder.with_writer(std::io::stderr).finish();
    set_global_default(subscriber).expect("Failed to set subscriber");
}

fn bootstrap_config(cli: &Cli) -> Option<BootstrapConfig> {
    let genesis_header = cli.genesis_header.as_ref()?;
    let genesis_header = hex::decode(genesis_header).unwrap_or_else(|e| {
        error!("Invalid genesis header hex: {}", e);
        std::process::exit(1);
    });
    // clap guarantees the period start hash is present alongside the header
    let period_start = cli.period_start_hash.as_ref().expect("required by clap");
    let period_start_hash = BlockHash::from_str(period_start).unwrap_or_else(|e| {
        error!("Invalid period start hash: {}", e);
        std::process::exit(1);
    });
    Some(BootstrapConfig {
        genesis_header,
        genesis_height: cli.genesis_height,
        period_start_hash_le: period_start_hash.to_byte_array(),
        finalization_parameter: cli.finalization_parameter,
    })
}

/// Broadcast a shutdown notification on SIGTERM or SIGINT.
async fn run_shutdown(tx_shutdown: broadcast::Sender<()>) -> Result<(), ()> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(|_| ())?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(|_| ())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
    };

    tx_shutdown.send(()).map(|_| ()).map_err(|_| ())
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    info!("SPV relay node is launching...");

    let (tx_shutdown, _) = broadcast::channel(1);

    let app_config = AppConfig {
        db_path: cli.db_path.clone(),
        api_requests_capacity: 1000,
        params: NetworkParams::mainnet(),
        fee_params: FeeParams {
            submission_cost: cli.submission_cost,
            baseline_queries: cli.baseline_queries,
            relayer_fee_pct: cli.relayer_fee_pct,
        },
        bootstrap: bootstrap_config(&cli),
    };
    let (mut app_server, app_client) = create_app(app_config, tx_shutdown.subscribe());

    let rpc_config = RpcConfig {
        rpc_host: cli.rpc_host.clone(),
        owner_token: cli.owner_token.clone(),
    };
    let rpc_server = RpcServer::new(rpc_config, app_client.clone(), tx_shutdown.subscribe());

    // Launching threads for each component
    let app_handle = tokio::spawn(async move { app_server.run().await });
    let rpc_handle = tokio::spawn(async move { rpc_server.run().await });
    let shutdown_handle = tokio::spawn(run_shutdown(tx_shutdown));

    // If at least one component exits with an error, the node will exit with an error
    match tokio::try_join!(
        flatten(app_handle),
        flatten(rpc_handle),
        flatten(shutdown_handle)
    ) {
        Ok(_) => {
            info!("SPV relay node has shut down");
            std::process::exit(0);
        }
        Err(_) => {
            error!("SPV relay node has exited with error");
            std::process::exit(1);
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, ()>>) -> Result<T, ()> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(()),
    }
}
