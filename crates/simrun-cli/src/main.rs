//! simrun CLI - submit simulation batches and inspect a master server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use simrun_core::{BookingState, ComputationTaskId, ConfigurationId, RunInformation, ServiceId};
use simrun_master::CoordinatorApi;
use simrun_runner::HttpCoordinatorClient;

mod batch;
mod submit;

use submit::SubmitOptions;

/// simrun CLI - simulation run orchestration tool
#[derive(Parser)]
#[command(name = "simrun")]
#[command(about = "CLI for simrun master servers", long_about = None)]
struct Cli {
    /// Master server address
    #[arg(short, long, default_value = "http://127.0.0.1:7070")]
    master: String,

    /// Timeout for calls to the master, in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch file of configurations and wait for their outcomes
    Submit {
        /// Batch file (JSON object or array of objects)
        file: PathBuf,

        /// Maximum number of runs executing at the same time
        #[arg(short, long, default_value = "4")]
        parallel: usize,

        /// Stop the whole batch at the first failed run
        #[arg(long)]
        cancel_on_error: bool,

        /// Bind address of the restart/recover callback server
        #[arg(long, default_value = "127.0.0.1:0")]
        callback_bind: String,

        /// Callback URL announced to the master (defaults to the bound address)
        #[arg(long)]
        callback_url: Option<String>,
    },

    /// List registered services
    Services,

    /// List runs managed by the master
    Runs,

    /// Stop a run
    Stop {
        /// Run (task) ID
        task_id: String,
    },

    /// Show the partition of a run
    Partition {
        /// Run (task) ID
        task_id: String,
    },

    /// Read a property a run published
    Property {
        /// Run (task) ID
        task_id: String,

        /// Property name
        name: String,
    },

    /// Report a broken host under a run
    Breakdown {
        /// Run (task) ID
        task_id: String,

        /// Service ID of the broken host
        service_id: String,
    },

    /// Shut the master server down
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let call_timeout = Duration::from_secs(cli.timeout_secs);
    let client = HttpCoordinatorClient::new(cli.master.clone(), call_timeout);

    match cli.command {
        Commands::Submit {
            file,
            parallel,
            cancel_on_error,
            callback_bind,
            callback_url,
        } => {
            let configs = batch::load(&file)?;
            let options = SubmitOptions {
                master_url: cli.master,
                parallel,
                cancel_on_error,
                callback_bind,
                callback_url,
                call_timeout,
            };
            println!("Submitting {} configuration(s)", configs.len());
            let results = submit::submit(configs, file.parent(), &options).await?;
            print_results(&results);

            let failed = results.iter().filter(|(_, info)| !info.is_success()).count();
            if failed > 0 {
                return Err(format!("{} of {} run(s) failed", failed, results.len()).into());
            }
        }
        Commands::Services => list_services(&client).await?,
        Commands::Runs => list_runs(&client).await?,
        Commands::Stop { task_id } => {
            client.stop(&ComputationTaskId::new(task_id.clone())).await?;
            println!("Stop requested for run {}", task_id);
        }
        Commands::Partition { task_id } => {
            let partition = client.get_partition(&ComputationTaskId::new(task_id)).await?;
            println!("{}", serde_json::to_string_pretty(&partition)?);
        }
        Commands::Property { task_id, name } => {
            let value = client
                .get_run_property(&ComputationTaskId::new(task_id), &name)
                .await?;
            match value {
                Some(value) => println!("{} = {}", name, value),
                None => println!("{} is not set", name),
            }
        }
        Commands::Breakdown {
            task_id,
            service_id,
        } => {
            client
                .report_breakdown(
                    &ComputationTaskId::new(task_id.clone()),
                    &ServiceId::new(service_id.clone()),
                )
                .await?;
            println!("Breakdown of {} reported for run {}", service_id, task_id);
        }
        Commands::Shutdown => {
            let aborted = client.shut_down().await?;
            println!("Master shut down ({} service(s) told to abort)", aborted);
        }
    }

    Ok(())
}

async fn list_services(client: &HttpCoordinatorClient) -> Result<(), Box<dyn std::error::Error>> {
    let services = client.list_services().await?;

    println!("Services ({}):", services.len());
    println!(
        "{:<36}  {:<12}  {:<14}  {:<20}  {}",
        "ID", "CAPABILITY", "BOOKING", "LAST HEARTBEAT", "ENDPOINT"
    );
    println!("{}", "-".repeat(110));

    for service in services {
        let booking = match &service.booking {
            BookingState::Free => "free".to_string(),
            BookingState::Booked(task_id) => format!("booked:{}", short(task_id.as_str())),
        };
        println!(
            "{:<36}  {:<12}  {:<14}  {:<20}  {}",
            service.descriptor.id,
            service.descriptor.capability,
            booking,
            service.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
            service.descriptor.endpoint
        );
    }

    Ok(())
}

async fn list_runs(client: &HttpCoordinatorClient) -> Result<(), Box<dyn std::error::Error>> {
    let runs = client.list_runs().await?;

    println!("Runs ({}):", runs.len());
    println!(
        "{:<36}  {:<12}  {:<9}  {}",
        "TASK", "STATE", "RESILIENT", "HOSTS"
    );
    println!("{}", "-".repeat(90));

    for run in runs {
        println!(
            "{:<36}  {:<12}  {:<9}  {}",
            run.task_id,
            run.state,
            if run.resilient { "yes" } else { "no" },
            run.hosts.join(", ")
        );
    }

    Ok(())
}

fn print_results(results: &[(ConfigurationId, RunInformation)]) {
    println!(
        "{:<10}  {:<36}  {:<9}  {:<12}  {:<10}  {}",
        "CONFIG", "TASK", "STATUS", "HOST", "RUN (ms)", "ERROR"
    );
    println!("{}", "-".repeat(110));

    for (config_id, info) in results {
        let status = if info.is_success() { "OK" } else { "FAILED" };
        let host = info
            .host
            .as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "local".to_string());
        let duration = info
            .run_duration_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        let error = match &info.failure {
            Some(failure) => match &failure.cause {
                Some(cause) => format!("{}: {} ({})", failure.kind, failure.message, cause),
                None => format!("{}: {}", failure.kind, failure.message),
            },
            None => String::new(),
        };
        println!(
            "{:<10}  {:<36}  {:<9}  {:<12}  {:<10}  {}",
            short(config_id.as_str()),
            info.task_id,
            status,
            host,
            duration,
            error
        );
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
