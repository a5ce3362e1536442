//! mqbridge - broker bridge entry point

use clap::{Parser, Subcommand};
use mqbridge::config::BridgeConfig;
use mqbridge::consumer::{Consumer, ConsumerExit};
use mqbridge::error::HandlerError;
use mqbridge::health::{HealthCheckManager, HealthProbe};
use mqbridge::message::{Attributes, Message};
use mqbridge::observability::{init_default_logging, HealthServer, LogController};
use mqbridge::producer::Producer;
use mqbridge::transport::mqtt::MqttDriver;
use mqbridge::transport::{BrokerDriver, DestinationKind};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Bridge between a message broker and a processing pipeline
#[derive(Parser)]
#[command(name = "mqbridge")]
#[command(about = "Consume, publish and probe a message broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume from the configured destination and serve /health and /log
    Run,
    /// Publish one JSON payload
    Publish {
        /// JSON document to publish
        #[arg(long)]
        payload: String,
        /// Topic to publish to (defaults to the configured topic)
        #[arg(long, conflicts_with = "queue")]
        topic: Option<String>,
        /// Queue to put to
        #[arg(long)]
        queue: Option<String>,
    },
    /// Probe the broker once and print the result
    Health,
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

    init_default_logging();

    info!("Starting mqbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let driver: Arc<dyn BrokerDriver> = MqttDriver::new();

    let result = match cli.command {
        Commands::Run => run_bridge(config, driver).await,
        Commands::Publish {
            payload,
            topic,
            queue,
        } => publish_once(config, driver, payload, topic, queue).await,
        Commands::Health => probe_once(config, driver).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in ["mqbridge.toml", "config/mqbridge.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create mqbridge.toml".into())
}

async fn run_bridge(
    config: BridgeConfig,
    driver: Arc<dyn BrokerDriver>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut checks = HealthCheckManager::new();
    checks.add_health_check(Box::new(HealthProbe::new(
        driver.clone(),
        config.broker.connection.clone(),
        Duration::from_millis(config.health.timeout_ms),
    )));
    let server = HealthServer::new(config.server.port, Arc::new(checks), LogController::default());

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.serve_with_shutdown(async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    }));

    let consumer = Consumer::new(
        driver,
        config.broker.clone(),
        config.consumer.kind,
        config.consumer.json,
    )?;
    info!(
        "Consuming from {} {}",
        consumer.kind(),
        consumer.destination()
    );
    let handle = consumer.subscribe(Arc::new(log_delivery));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let mut state = handle.watch_state();
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        _ = state.wait_for(|s| s.is_terminal()) => error!("Consumer ended before shutdown"),
    }

    let exit = handle.stop().await;
    let _ = shutdown_tx.send(true);
    if let Ok(Err(e)) = server_task.await {
        error!("Health server error: {}", e);
    }

    match exit {
        ConsumerExit::Stopped => Ok(()),
        ConsumerExit::Failed(e) => Err(e.into()),
        ConsumerExit::Aborted => Err("consumer task aborted".into()),
    }
}

/// Default pipeline stage for `run`: log each delivery
async fn log_delivery(
    payload: String,
    _attributes: Attributes,
    raw: Message<String>,
) -> Result<(), HandlerError> {
    info!(
        message_id = raw.id.as_deref().unwrap_or(""),
        "Received message: {}", payload
    );
    Ok(())
}

async fn publish_once(
    config: BridgeConfig,
    driver: Arc<dyn BrokerDriver>,
    payload: String,
    topic: Option<String>,
    queue: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let document: serde_json::Value = serde_json::from_str(&payload)?;

    match (topic, queue) {
        (_, Some(queue)) => {
            Producer::new(driver, config.broker, DestinationKind::Queue)
                .publish_to(&queue, &document)
                .await?
        }
        (Some(topic), None) => {
            Producer::new(driver, config.broker, DestinationKind::Topic)
                .publish_to(&topic, &document)
                .await?
        }
        (None, None) => {
            Producer::new(driver, config.broker, DestinationKind::Topic)
                .publish(&document)
                .await?
        }
    }

    println!("message was published");
    Ok(())
}

async fn probe_once(
    config: BridgeConfig,
    driver: Arc<dyn BrokerDriver>,
) -> Result<(), Box<dyn std::error::Error>> {
    let probe = HealthProbe::new(
        driver,
        config.broker.connection,
        Duration::from_millis(config.health.timeout_ms),
    );
    let result = probe.build(probe.check().await);
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.healthy {
        Ok(())
    } else {
        Err(format!("{} is down", result.service_name).into())
    }
}

fn handle_config_command(
    mut config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        if !config.broker.connection.password.is_empty() {
            config.broker.connection.password = "***".to_string();
        }
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
