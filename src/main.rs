use anyhow::{Context, Result};
use camtrap_bus::{install_prometheus, Broker, BrokerConfig};
use camtrap_core::config::{LogFormat, LoggingConfig};
use camtrap_core::{PipelineConfig, PluginRole};
use camtrap_plugins::{run_role, ExitReason};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Camtrap - event pipeline for camera-trap images
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/camtrap.yaml", env = "CAMTRAP_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the bus hub
    Bus,
    /// Emit the images of the source directory
    Ingest,
    /// Acknowledge new images
    Recv,
    /// Score images with the configured detector
    Score,
    /// Decide whether scored images are kept
    Store,
    /// Record the lifecycle of every image and detect completion
    Oracle,
    /// Sample power for monitored processes
    Power,
    /// Log every event
    Observe,
}

impl Command {
    fn role(self) -> Option<PluginRole> {
        match self {
            Command::Bus => None,
            Command::Ingest => Some(PluginRole::ImageGenerating),
            Command::Recv => Some(PluginRole::ImageReceiving),
            Command::Score => Some(PluginRole::ImageScoring),
            Command::Store => Some(PluginRole::ImageStoring),
            Command::Oracle => Some(PluginRole::Oracle),
            Command::Power => Some(PluginRole::PowerMeasuring),
            Command::Observe => Some(PluginRole::Observer),
        }
    }
}

/// `RUST_LOG` takes precedence over the configured level
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = logging.parse_level()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

async fn run_bus(config: &PipelineConfig) -> Result<()> {
    install_prometheus(&config.metrics).context("Failed to install metrics exporter")?;

    let bus = Broker::start(BrokerConfig::from_pipeline(config))
        .await
        .context("Failed to start bus hub")?;
    info!(addrs = ?bus.local_addrs(), "Bus hub running");

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping bus hub...");

    let metrics = bus.metrics();
    info!(
        received = metrics.frames_received(),
        forwarded = metrics.frames_forwarded(),
        dropped = metrics.frames_dropped(),
        "Bus hub totals"
    );
    bus.shutdown();
    bus.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = PipelineConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;
    config.validate().context("Invalid configuration")?;
    init_tracing(&config.logging)?;
    info!("Configuration loaded from {:?}", args.config);

    let Some(role) = args.command.role() else {
        return run_bus(&config).await;
    };

    let config = Arc::new(config);
    tokio::select! {
        result = run_role(role, config) => {
            match result.with_context(|| format!("{role} plugin failed"))? {
                ExitReason::TransportFailed(reason) => {
                    error!(role = %role, reason = %reason, "Plugin lost the bus");
                    anyhow::bail!("{role} plugin lost the bus: {reason}");
                }
                reason => info!(role = %role, reason = %reason, "Plugin finished"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping plugin...");
        }
    }

    Ok(())
}
