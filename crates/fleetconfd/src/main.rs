mod config;
mod rpc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetconf_core::{
    Command, ConnOp, Controller, MemDatastore, SshConnector,
};

use crate::rpc::RpcServer;

#[derive(Debug, Parser)]
#[command(name = "fleetconfd", about = "Network configuration controller daemon")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Override the RPC socket path.
    #[arg(short = 's', long = "socket")]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Do not connect devices at startup.
    #[arg(long)]
    no_connect: bool,
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut profile = config::load_config(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        profile.socket = socket;
    }

    let controller_config = config::controller_config(&profile);
    let inventory = config::inventory(&profile);
    let policy = config::schema_policy(&profile);
    info!(
        devices = inventory.len(),
        socket = %profile.socket.display(),
        "starting fleetconfd"
    );

    let (controller, reactor) = Controller::spawn(
        controller_config,
        inventory,
        Arc::new(SshConnector),
        Box::new(MemDatastore::new()),
        policy,
    );

    if !cli.no_connect {
        controller
            .execute(Command::ConnectionChange {
                pattern: "*".into(),
                op: ConnOp::Open,
            })
            .await?;
    }

    let cancel = CancellationToken::new();
    let server = RpcServer::new(controller.clone(), profile.socket.clone(), cancel.clone());
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    controller.shutdown();
    let _ = server_task.await;
    let _ = reactor.await;
    Ok(())
}
