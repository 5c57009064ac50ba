//! ninja2mqtt - NinjaCape hub to MQTT bridge daemon
//!
//! This binary runs the bridge with:
//! - the hub on a serial port (feature `serial`)
//! - an MQTT broker session for state and commands
//! - the LED scheduler (hourly blinks, night mode)
//! - optional Pushover notifications and InfluxDB sensor samples

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ninja_bridge::{
    client_publisher, BridgeConfig, BridgeConfigBuilder, BridgeContext, InfluxSink, MqttSession,
    NinjaBridge, Notifier, NullNotifier, NullTimeSeries, PushoverNotifier, SqliteStore,
    SystemClock, TimeSeriesSink,
};

#[derive(Parser, Debug)]
#[command(name = "ninja2mqtt")]
#[command(about = "Bridge a NinjaCape serial hub to an MQTT broker")]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial device of the hub (overrides the config file)
    #[arg(long)]
    serial_port: Option<PathBuf>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// MQTT broker host
    #[arg(long)]
    broker: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// Database path for persisted LED state
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    /// Load the config file (or defaults) and apply command-line overrides
    fn load_config(&self) -> anyhow::Result<BridgeConfig> {
        let config = match &self.config {
            Some(path) => BridgeConfig::from_toml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        let mut builder = BridgeConfigBuilder::from_config(config.clone());
        if let Some(port) = &self.serial_port {
            builder = builder.serial_port(port.clone());
        }
        if let Some(baud) = self.baud {
            builder = builder.baud_rate(baud);
        }
        if self.broker.is_some() || self.broker_port.is_some() {
            builder = builder.broker(
                self.broker.clone().unwrap_or(config.mqtt.host),
                self.broker_port.unwrap_or(config.mqtt.port),
            );
        }
        if let Some(db) = &self.db {
            builder = builder.database(db.clone());
        }

        let mut config = builder.build();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.load_config()?;
    info!(
        serial = %config.serial.port.display(),
        broker = %config.mqtt.host,
        tz = %config.schedule.time_zone,
        "Starting ninja2mqtt"
    );

    let store = SqliteStore::open(&config.persistence.path)
        .await
        .with_context(|| format!("opening {}", config.persistence.path.display()))?;

    let notifier: Arc<dyn Notifier> = if config.notifier.is_configured() {
        Arc::new(PushoverNotifier::new(config.notifier.clone())?)
    } else {
        warn!("Pushover credentials not set, notifications disabled");
        Arc::new(NullNotifier)
    };

    let timeseries: Arc<dyn TimeSeriesSink> = match InfluxSink::from_config(&config.timeseries)? {
        Some(sink) => Arc::new(sink),
        None => {
            info!("No time-series endpoint configured");
            Arc::new(NullTimeSeries)
        }
    };

    let session = MqttSession::connect(&config.mqtt)
        .await
        .with_context(|| format!("connecting to MQTT broker {}:{}", config.mqtt.host, config.mqtt.port))?;

    let serial = config.serial.clone();
    let ctx = BridgeContext::new(
        config,
        client_publisher(session.client()),
        notifier,
        timeseries,
        Arc::new(store.clone()),
    );
    let (bridge, handle) = NinjaBridge::new(ctx, Arc::new(SystemClock))?;

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            if let Err(e) = shutdown.shutdown().await {
                warn!(error = %e, "Bridge already stopped");
            }
        }
    });

    let result = run_bridge(bridge, &serial, session).await;
    store.close().await;

    if let Err(e) = &result {
        error!(error = %e, "Bridge terminated");
    }
    result
}

#[cfg(feature = "serial")]
async fn run_bridge(
    bridge: NinjaBridge,
    serial: &ninja_bridge::SerialConfig,
    session: MqttSession,
) -> anyhow::Result<()> {
    let link = ninja_bridge::SerialLink::from_config(serial);
    let (reader, writer) = link
        .open()
        .with_context(|| format!("opening {}", link.name()))?;
    bridge.run(reader, writer, Some(session)).await?;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_bridge(
    _bridge: NinjaBridge,
    serial: &ninja_bridge::SerialConfig,
    _session: MqttSession,
) -> anyhow::Result<()> {
    anyhow::bail!(
        "built without the `serial` feature, cannot open {}",
        serial.port.display()
    )
}
