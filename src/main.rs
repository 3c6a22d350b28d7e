//! Telemetry agent - main entry point
//!
//! Loads configuration, resolves credentials and runs the agent loop until
//! SIGINT or SIGTERM. Only configuration problems end the process with an
//! error; everything on the link side is retried.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use telemetry_agent::agent::{
    source_from_config, AgentRuntime, CommandDispatcher, LogHandler, ReconnectionSupervisor,
    RuntimeSettings, TelemetryPublisher,
};
use telemetry_agent::config::{AgentConfig, Credentials};
use telemetry_agent::observability::logging::{init_logging, LogFormat};
use telemetry_agent::observability::{init_default_logging, LinkStats};
use telemetry_agent::transport::mqtt::RumqttcBackend;
use telemetry_agent::transport::HostNetwork;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, Level};

/// Default configuration search path
const DEFAULT_CONFIG_PATHS: &[&str] = &["telemetry-agent.toml", "config/telemetry-agent.toml"];

/// Resilient MQTT telemetry agent
#[derive(Parser)]
#[command(name = "telemetry-agent")]
#[command(about = "Publishes device telemetry and handles commands over MQTT with mutual TLS")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); ignored when LOG_LEVEL is set
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_observability(cli.verbose);

    info!("Starting telemetry agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn init_observability(verbose: u8) {
    if verbose == 0 || std::env::var("LOG_LEVEL").is_ok() {
        init_default_logging();
        return;
    }

    let level = if verbose == 1 { Level::DEBUG } else { Level::TRACE };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    init_logging(level, format, false);
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AgentConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_agent(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = Arc::new(Credentials::load(&config)?);
    info!(
        client_id = %credentials.client_id,
        endpoint = %credentials.endpoint,
        "Credentials loaded"
    );

    let mut runtime = build_runtime(&config, credentials)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
    });

    runtime.run(shutdown_rx).await?;
    info!(stats = ?runtime.stats().snapshot(), "Final link statistics");
    Ok(())
}

/// Wire the production backends into a runtime
fn build_runtime(
    config: &AgentConfig,
    credentials: Arc<Credentials>,
) -> Result<AgentRuntime<RumqttcBackend, HostNetwork>, Box<dyn std::error::Error>> {
    let stats = Arc::new(LinkStats::new());

    let supervisor = ReconnectionSupervisor::new(
        RumqttcBackend::new(),
        HostNetwork::new(),
        credentials,
        config.reconnect_config(),
        stats.clone(),
    );

    let subscribe_topic = config.subscribe_topic();
    let mut dispatcher = CommandDispatcher::new(stats.clone());
    for name in &config.commands.names {
        dispatcher.register(subscribe_topic.clone(), name.clone(), Arc::new(LogHandler))?;
    }

    let publisher = TelemetryPublisher::from_config(config, stats.clone());
    let source = source_from_config(&config.telemetry.source);

    Ok(AgentRuntime::new(
        supervisor,
        dispatcher,
        publisher,
        source,
        RuntimeSettings::from_config(config),
        stats,
    ))
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = config.broker_endpoint()?;
    info!(
        client_id = %config.device.client_id,
        endpoint = %endpoint,
        publish = %config.publish_topic(),
        subscribe = %config.subscribe_topic(),
        "Configuration is valid"
    );

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    Ok(())
}
