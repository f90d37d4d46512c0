//! thingsync - command line entry point
//!
//! `run` keeps the device online: it reconciles shadow deltas and handles
//! FOTA jobs until interrupted. The other commands issue a single shadow or
//! jobs request and exit.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use thingsync::config::ThingConfig;
use thingsync::jobs::{Jobs, JobsOptions};
use thingsync::observability::{init_default_logging, init_logging, LogFormat};
use thingsync::ota::{CommandUpdater, FotaCoordinator};
use thingsync::protocol::{JobId, JobStatus, StateMap, StatusDetails};
use thingsync::shadow::Shadow;
use thingsync::{MqttClient, ThingError, ThingSession};
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn, Level};

/// Device shadow and jobs client
#[derive(Parser)]
#[command(name = "thingsync")]
#[command(about = "Device shadow synchronization and remote jobs over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML, or a thing.conf.json)
    #[arg(short, long, value_name = "FILE", env = "THINGSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stay connected, reconcile shadow deltas and handle firmware jobs
    Run,
    /// Shadow operations
    Shadow {
        #[command(subcommand)]
        command: ShadowCommand,
    },
    /// Jobs operations
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[derive(Subcommand)]
enum ShadowCommand {
    /// Publish a reported state
    Report {
        /// JSON object to report
        #[arg(long)]
        state: String,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List in-progress and queued executions
    List,
    /// Show status, version and document of one execution
    Describe { job_id: String },
    /// Post a new execution status
    Update {
        job_id: String,
        status: JobStatus,
        /// Status detail as key=value, repeatable
        #[arg(long = "detail", value_parser = parse_detail)]
        details: Vec<(String, String)>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Pretty, true),
    }

    let config = match ThingConfig::discover(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Shadow { command } => handle_shadow_command(config, command).await,
        Commands::Jobs { command } => handle_jobs_command(config, command).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

async fn run(config: ThingConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting thingsync v{} for thing {}",
        env!("CARGO_PKG_VERSION"),
        config.thing.name
    );
    let (session, client) = ThingSession::connect(&config).await?;

    let shadow = Shadow::new(Arc::clone(&session));
    shadow.on_delta(|requested| Some(requested.clone())).await?;

    let mut initial = StateMap::new();
    initial.insert(
        "firmware_version".to_string(),
        Value::from(config.ota.firmware_version),
    );
    shadow.report(&initial).await?;

    let jobs = Arc::new(Jobs::new(Arc::clone(&session), JobsOptions::from(&config.jobs)).await?);
    let updater = CommandUpdater::new(config.ota.firmware_version, config.ota.update_command.clone());
    let coordinator = FotaCoordinator::new(jobs, Arc::new(updater));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut ticker = tokio::time::interval(config.jobs.poll_interval());
    let mut force = true;

    info!("Thing is running; waiting for deltas and jobs");
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = monitor_connection_health(&client) => {
                error!("MQTT connection permanently lost, shutting down...");
                break;
            }
            _ = ticker.tick() => {
                match coordinator.poll(force).await {
                    Ok(actions) => {
                        for action in actions {
                            info!(?action, "Firmware job handled");
                        }
                        force = false;
                    }
                    Err(e) => warn!("Jobs poll failed: {}", e),
                }
            }
        }
    }

    if let Err(e) = shadow.close().await {
        warn!("Failed to stop shadow listener: {}", e);
    }
    client.disconnect().await?;
    info!("Application shutdown complete");
    Ok(())
}

async fn handle_shadow_command(
    config: ThingConfig,
    command: ShadowCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let ShadowCommand::Report { state } = command;
    let state = parse_state(&state)?;

    let (session, client) = ThingSession::connect(&config).await?;
    let result = Shadow::new(session).report(&state).await;
    client.disconnect().await?;
    result?;

    println!("Reported {} key(s)", state.len());
    Ok(())
}

async fn handle_jobs_command(
    config: ThingConfig,
    command: JobsCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let (session, client) = ThingSession::connect(&config).await?;
    let jobs = Jobs::new(session, JobsOptions::from(&config.jobs)).await?;

    let result = match command {
        JobsCommand::List => list_jobs(&jobs).await,
        JobsCommand::Describe { job_id } => describe_job(&jobs, job_id).await,
        JobsCommand::Update {
            job_id,
            status,
            details,
        } => update_job(&jobs, job_id, status, details.into_iter().collect()).await,
    };

    drop(jobs);
    client.disconnect().await?;
    result
}

async fn list_jobs(jobs: &Jobs) -> Result<(), Box<dyn std::error::Error>> {
    let listing = jobs.list().await?;
    if listing.is_empty() {
        println!("No pending jobs");
        return Ok(());
    }
    for job in &listing.in_progress {
        println!("IN_PROGRESS  {}", job.id());
    }
    for job in &listing.queued {
        println!("QUEUED       {}", job.id());
    }
    Ok(())
}

async fn describe_job(jobs: &Jobs, job_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut job = jobs.job(JobId::new(job_id)?);
    job.describe().await?;

    println!("job:      {job}");
    if let Some(status) = job.status() {
        println!("status:   {status}");
    }
    if let Some(version) = job.version() {
        println!("version:  {version}");
    }
    if let Some(document) = job.document() {
        println!("document: {}", serde_json::to_string_pretty(document)?);
    }
    Ok(())
}

async fn update_job(
    jobs: &Jobs,
    job_id: String,
    status: JobStatus,
    details: StatusDetails,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut job = jobs.job(JobId::new(job_id)?);
    // Fetch the version so the update carries an expected-version precondition
    if let Err(e) = job.describe().await {
        warn!("Describe failed, updating without expected version: {}", e);
    }
    job.update(status, details).await?;
    println!("{job} is now {status}");
    Ok(())
}

fn handle_config_command(config: ThingConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn parse_state(raw: &str) -> Result<StateMap, ThingError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ThingError::invalid_input("state must be a JSON object")),
        Err(e) => Err(ThingError::invalid_input(format!("state is not valid JSON: {e}"))),
    }
}

fn parse_detail(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

/// Resolve once the MQTT client has given up reconnecting
async fn monitor_connection_health(client: &MqttClient) {
    loop {
        if client.is_permanently_disconnected() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
