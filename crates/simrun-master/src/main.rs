//! simrun Master Server

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use simrun_master::http::create_router;
use simrun_master::monitor::run_heartbeat_monitor;
use simrun_master::{
    Config, Coordinator, CoordinatorApi, HttpHostConnector, InMemoryRegistry,
    InMemoryResilienceStore,
};

/// simrun master server
#[derive(Parser, Debug)]
#[command(name = "simrun-master")]
#[command(about = "Books worker hosts and dispatches simulation runs")]
struct Args {
    /// HTTP bind address
    #[arg(long, default_value = "127.0.0.1:7070")]
    bind: String,

    /// Booking attempts before a run fails for lack of hosts
    #[arg(long, default_value = "10")]
    booking_attempts: u32,

    /// Initial wait between booking attempts, in milliseconds
    #[arg(long, default_value = "1000")]
    booking_retry_delay_ms: u64,

    /// Upper bound for the wait between booking attempts, in milliseconds
    #[arg(long, default_value = "8000")]
    booking_max_delay_ms: u64,

    /// Timeout for short remote calls, in seconds
    #[arg(long, default_value = "30")]
    remote_call_timeout_secs: u64,

    /// Upper bound on one run's execution, in seconds
    #[arg(long)]
    run_timeout_secs: Option<u64>,

    /// Heartbeat interval announced to services, in seconds
    #[arg(long, default_value = "15")]
    heartbeat_interval_secs: u64,

    /// Heartbeat age after which a host counts as broken down, in seconds
    #[arg(long, default_value = "45")]
    heartbeat_timeout_secs: u64,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            bind_addr: self.bind,
            booking_attempts: self.booking_attempts,
            booking_retry_delay_ms: self.booking_retry_delay_ms,
            booking_max_delay_ms: self.booking_max_delay_ms,
            remote_call_timeout_secs: self.remote_call_timeout_secs,
            run_timeout_secs: self.run_timeout_secs,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
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

    let config = args.into_config();
    let http_addr: SocketAddr = config.bind_addr.parse()?;

    let connector = HttpHostConnector::new(config.remote_call_timeout(), config.run_timeout());
    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(InMemoryResilienceStore::new()),
        Arc::new(connector),
    ));
    let shutdown = coordinator.shutdown_token();

    let monitor = tokio::spawn(run_heartbeat_monitor(
        coordinator.clone(),
        std::time::Duration::from_secs(config.heartbeat_interval_secs.max(1)),
        config.heartbeat_timeout(),
        shutdown.clone(),
    ));

    info!(
        http_addr = %http_addr,
        version = %config.framework_version,
        "Starting simrun master server"
    );

    let listener = TcpListener::bind(http_addr).await?;
    let router = create_router(coordinator.clone());
    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
            _ = server_shutdown.cancelled() => info!("Shutdown requested"),
        }
    });

    info!("HTTP server listening on {}", http_addr);

    if let Err(e) = server.await {
        error!(error = %e, "HTTP server error");
    }

    if let Err(e) = coordinator.shut_down().await {
        error!(error = %e, "Shutdown failed");
    }
    shutdown.cancel();
    let _ = monitor.await;

    info!("Master server stopped");
    Ok(())
}
