//! fieldsync CLI
//!
//! Command-line entry point for the realtime event distribution service:
//! - Run the service against a JSON state document
//! - Watch inbound events on an endpoint
//! - Print the default configuration

use anyhow::Context;
use clap::{Parser, Subcommand};
use fieldsync::broadcast::JsonFileSource;
use fieldsync::config::{generate_default_config, Config};
use fieldsync::connection::WsConnector;
use fieldsync::events::{EventBus, ANY_EVENT};
use fieldsync::protocol::{ConnectionState, EventType};
use fieldsync::router::{RecipientContext, UserRole};
use fieldsync::service::{RealtimeService, SubscriptionFilters};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time event distribution for field operations")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the realtime service until Ctrl-C
    Run {
        /// Override the endpoint URL
        #[arg(long)]
        url: Option<String>,
        /// Override the JSON state document path
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Do not start the change broadcaster
        #[arg(long)]
        no_broadcast: bool,
    },

    /// Connect and print every inbound event as JSON
    Watch {
        /// Override the endpoint URL
        #[arg(long)]
        url: Option<String>,
        /// Event types to subscribe to (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        events: Vec<String>,
    },

    /// Print the default configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        return write_default_config(output.as_ref());
    }

    let config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    fieldsync::logging::init(&config.logging).context("failed to install log subscriber")?;

    match cli.command {
        Commands::Run {
            url,
            snapshot,
            no_broadcast,
        } => run(config, url, snapshot, no_broadcast).await,
        Commands::Watch { url, events } => watch_events(config, url, events).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn write_default_config(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let content = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

async fn run(
    mut config: Config,
    url: Option<String>,
    snapshot: Option<PathBuf>,
    no_broadcast: bool,
) -> anyhow::Result<()> {
    if let Some(url) = url {
        config.connection.url = url;
    }
    if let Some(path) = snapshot {
        config.source.snapshot_path = path.to_string_lossy().to_string();
    }

    let mut options = config.service_options()?;
    options.broadcaster_enabled &= !no_broadcast;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.connection.url,
        snapshot = %config.source.snapshot_path,
        broadcaster = options.broadcaster_enabled,
        "Starting fieldsync"
    );

    let source = JsonFileSource::new(&config.source.snapshot_path);
    let service = RealtimeService::new(
        options,
        Arc::new(WsConnector),
        Arc::new(source),
        Arc::new(EventBus::new()),
    )?;

    let status_log = tokio::spawn(log_status(service.status()));
    service.on(ANY_EVENT, |event| {
        tracing::info!(
            event_type = %event.event_type,
            origin = ?event.origin,
            id = ?event.message_id,
            "Event"
        );
        Ok(())
    });

    if let Err(e) = service.start().await {
        tracing::warn!(error = %e, "Initial connect failed, retrying in background");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    service.destroy();
    status_log.abort();
    Ok(())
}

async fn watch_events(mut config: Config, url: Option<String>, events: Vec<String>) -> anyhow::Result<()> {
    if let Some(url) = url {
        config.connection.url = url;
    }

    let event_types = events
        .iter()
        .map(|e| e.parse::<EventType>())
        .collect::<Result<Vec<_>, _>>()?;

    let mut options = config.service_options()?;
    options.broadcaster_enabled = false;
    if options.context.is_none() {
        tracing::info!("No recipient context configured, watching as admin");
        options.context = Some(RecipientContext::new("fieldsync-watch", UserRole::Admin));
    }

    let service = RealtimeService::new(
        options,
        Arc::new(WsConnector),
        Arc::new(JsonFileSource::new(&config.source.snapshot_path)),
        Arc::new(EventBus::new()),
    )?;

    service.on(ANY_EVENT, |event| {
        println!("{}", serde_json::to_string(event)?);
        Ok(())
    });
    if !event_types.is_empty() {
        service.subscribe(event_types, SubscriptionFilters::new())?;
    }

    let status_log = tokio::spawn(log_status(service.status()));
    if let Err(e) = service.start().await {
        tracing::warn!(error = %e, "Initial connect failed, retrying in background");
    }

    tokio::signal::ctrl_c().await?;
    service.destroy();
    status_log.abort();
    Ok(())
}

async fn log_status(mut status: watch::Receiver<ConnectionState>) {
    while status.changed().await.is_ok() {
        let state = status.borrow_and_update().clone();
        match state {
            ConnectionState::Reconnecting { attempt } => {
                tracing::info!(attempt, "Connection status: reconnecting")
            }
            other => tracing::info!(state = other.label(), "Connection status"),
        }
    }
}
