//! simrun Worker Daemon

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use simrun_core::{DefaultModelReader, ServiceId, SetupStrategies};

mod config;
mod connection;
mod executor;
mod server;

use config::Config;
use connection::MasterConnection;
use executor::RunHost;

/// simrun worker host
#[derive(Parser, Debug)]
#[command(name = "simrun-worker")]
#[command(about = "Hosts simulation runs dispatched by a simrun master")]
struct Args {
    /// Master server URL
    #[arg(long, default_value = "http://127.0.0.1:7070")]
    master: String,

    /// Bind address of the run API
    #[arg(long, default_value = "127.0.0.1:7071")]
    bind: String,

    /// URL the master should use to reach this worker
    #[arg(long)]
    endpoint: Option<String>,

    /// Service ID to register under (generated when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Capability offered to the master
    #[arg(long, default_value = simrun_core::SIMULATION_CAPABILITY)]
    capability: String,

    /// Directory relative model paths resolve against
    #[arg(long)]
    model_dir: Option<String>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value = "10")]
    heartbeat_interval_secs: u64,

    /// Delay before registering again after losing the master, in seconds
    #[arg(long, default_value = "5")]
    reconnect_delay_secs: u64,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn to_config(&self) -> Config {
        Config {
            master_url: self.master.clone(),
            worker_id: self
                .id
                .clone()
                .map(ServiceId::new)
                .unwrap_or_else(ServiceId::generate),
            bind_addr: self.bind.clone(),
            advertised_endpoint: self.endpoint.clone(),
            capability: self.capability.clone(),
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            reconnect_delay_secs: self.reconnect_delay_secs,
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Arc::new(args.to_config());
    let addr: SocketAddr = config.bind_addr.parse()?;

    info!(
        worker_id = %config.worker_id,
        master = %config.master_url,
        endpoint = %config.endpoint(),
        "Starting simrun worker"
    );

    let model_reader = match &args.model_dir {
        Some(dir) => DefaultModelReader::with_base_dir(dir),
        None => DefaultModelReader::default(),
    };
    let (checkpoint_tx, checkpoint_rx) = mpsc::unbounded_channel();
    let host = Arc::new(
        RunHost::new(Arc::new(model_reader), SetupStrategies::with_builtin())
            .with_checkpoint_sender(checkpoint_tx),
    );

    let shutdown = CancellationToken::new();
    let connection = Arc::new(MasterConnection::new(config.clone()));
    let registration = {
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { connection.run(shutdown).await })
    };
    let forwarder = {
        let connection = connection.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { connection.forward_checkpoints(checkpoint_rx, shutdown).await })
    };

    let listener = TcpListener::bind(addr).await?;
    info!("Run API listening on {}", addr);
    let server = axum::serve(listener, server::create_router(host.clone())).with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
        }
    });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    shutdown.cancel();
    host.abort().await;
    if let Err(e) = connection.unregister().await {
        warn!(error = %e, "Unregistering from master failed");
    }
    let _ = registration.await;
    let _ = forwarder.await;

    info!("Worker stopped");
    Ok(())
}
