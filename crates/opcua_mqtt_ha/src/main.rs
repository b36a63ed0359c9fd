use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use opcua_mqtt_ha::Bridge;
use opcua_mqtt_ha::Config;
use opcua_mqtt_ha::LogLevel;
use opcua_mqtt_ha::OpcUaClient;
use opcua_mqtt_ha::RumqttcClient;
use opcua_mqtt_ha::TopicBuilder;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Expose OPC UA devices to Home Assistant over MQTT"
)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file and LOG_LEVEL
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // RUST_LOG wins over the configured levels
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter_directives()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!("opcua-mqtt-homeassistant {} starting", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config {
        tracing::info!("Loaded config from: {}", path.display());
    }
    tracing::info!(
        "OPC UA server {}, MQTT broker {}:{}, bridge id {}",
        config.opcua.url,
        config.mqtt.broker,
        config.mqtt.port,
        config.bridge.id
    );

    let topics = TopicBuilder::new(&config.mqtt.discovery_prefix, &config.bridge.id);
    let address_space = OpcUaClient::new(config.opcua.clone());
    let client = RumqttcClient::new(&config.mqtt, &topics.availability_topic());
    let bridge = Bridge::new(address_space, client, &config);

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal");
            }
            Err(e) => {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        }
    };

    if let Err(e) = bridge.run_until(shutdown).await {
        tracing::error!("Bridge failed to start: {}", e);
        bridge.shutdown().await;
        return Err(e).context("Bridge failed to start");
    }

    tracing::info!("opcua-mqtt-homeassistant stopped");
    Ok(())
}
