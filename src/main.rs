mod beehive;
mod config;
mod coverage;
mod fieldtest;
mod lns;
mod mqtt;
mod pipeline;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FileConfig, MqttEndpoint, RelayConfig};
use crate::fieldtest::encoder::FrameFormat;
use crate::lns::ParserVariant;
use crate::pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "field-tester-relay")]
#[command(about = "Answers LoRaWAN Field Tester uplinks with signal-coverage downlinks")]
#[command(version)]
struct Cli {
    /// DevEUI (or The Things Stack device ID) of the field tester
    #[arg(long = "device-devui", env = "DEVICE_DEVUI")]
    device_devui: String,

    /// Logging level (10=DEBUG, 20=INFO, 30=WARNING, 40=ERROR, 50=CRITICAL)
    #[arg(long = "logging_level", env = "LOGGING_LEVEL", default_value_t = 10)]
    logging_level: u8,

    /// Network server the uplinks come from (ChirpStack_v3+ or TheThingsStack_v3)
    #[arg(long = "parser_type", env = "PARSER_TYPE", default_value = "ChirpStack_v3+")]
    parser_type: ParserVariant,

    #[arg(long = "mqtt-server-ip", env = "MQTT_SERVER_HOST", default_value = "wes-rabbitmq")]
    mqtt_server_ip: String,

    #[arg(long = "mqtt-server-port", env = "MQTT_SERVER_PORT", default_value_t = 1883)]
    mqtt_server_port: u16,

    /// Overrides the topic derived from the parser type and DevEUI
    #[arg(long = "mqtt-subscribe-topic", env = "MQTT_SUBSCRIBE_TOPIC")]
    mqtt_subscribe_topic: Option<String>,

    /// Forward measurements to Beehive
    #[arg(long)]
    publish: bool,

    /// Optional TOML file with coverage, MQTT and Beehive settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Layout of the downlink frame
    #[arg(long = "downlink-format", value_enum, default_value_t = FrameFormat::Coverage)]
    downlink_format: FrameFormat,

    /// Upper bound (exclusive) of GOOD coverage in meters
    #[arg(long = "good-max-distance")]
    good_max_distance: Option<f64>,

    /// Upper bound (inclusive) of FAIR coverage in meters
    #[arg(long = "fair-max-distance")]
    fair_max_distance: Option<f64>,

    /// Beehive measurement endpoint
    #[arg(long = "beehive-url", env = "BEEHIVE_URL")]
    beehive_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::level_filter(cli.logging_level))),
        )
        .init();

    let file_config = match &cli.config {
        Some(path) => FileConfig::load(path).unwrap_or_else(|e| {
            warn!("Failed to load config from {:?}: {}", path, e);
            warn!("Using default configuration");
            FileConfig::default()
        }),
        None => FileConfig::default(),
    };

    let mut thresholds = file_config.coverage;
    if let Some(good) = cli.good_max_distance {
        thresholds.good_max_m = good;
    }
    if let Some(fair) = cli.fair_max_distance {
        thresholds.fair_max_m = fair;
    }

    let relay_config = Arc::new(RelayConfig::new(
        &cli.device_devui,
        cli.parser_type,
        cli.mqtt_subscribe_topic.clone(),
        cli.downlink_format,
        thresholds,
        cli.publish,
    )?);

    let endpoint = MqttEndpoint {
        host: cli.mqtt_server_ip.clone(),
        port: cli.mqtt_server_port,
        settings: file_config.mqtt.clone(),
    };

    info!("Field Tester relay v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");
    info!("  Device:     {}", relay_config.device_eui);
    info!("  Parser:     {}", relay_config.parser_variant);
    info!("  Broker:     {}:{}", endpoint.host, endpoint.port);
    info!("  Subscribe:  {}", relay_config.subscribe_topic);
    info!("  Downlink:   {:?}", relay_config.frame_format);
    info!(
        "  Coverage:   good < {} m, fair <= {} m",
        relay_config.thresholds.good_max_m, relay_config.thresholds.fair_max_m
    );
    info!("===========================================");

    let (client, eventloop) = mqtt::connect(&endpoint);
    let publisher = Arc::new(mqtt::MqttPublisher::new(client.clone()));
    let mut pipeline = Pipeline::new(relay_config.clone(), publisher);

    if relay_config.publish {
        let mut beehive_config = file_config.beehive.clone();
        if let Some(url) = cli.beehive_url.clone() {
            match beehive_config.as_mut() {
                Some(cfg) => cfg.url = url,
                None => beehive_config = Some(config::BeehiveConfig::new(url)),
            }
        }

        match beehive_config {
            Some(beehive_config) => {
                if let Some(tx) = spawn_beehive_task(beehive_config)? {
                    pipeline = pipeline.with_beehive(tx);
                }
            }
            None => warn!("--publish set but no Beehive URL configured, measurements are dropped"),
        }
    } else {
        info!("Beehive publishing disabled");
    }

    info!("Relay running. Press Ctrl+C to stop.");
    tokio::select! {
        result = mqtt::run_event_loop(client.clone(), eventloop, &endpoint, &pipeline) => {
            if let Err(e) = &result {
                error!("MQTT loop stopped: {}", e);
            }
            result?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
            if let Err(e) = client.try_disconnect() {
                warn!("Failed to disconnect cleanly: {}", e);
            }
        }
    }

    Ok(())
}

/// Start the background Beehive publisher and return its queue
#[cfg(feature = "beehive")]
fn spawn_beehive_task(
    config: config::BeehiveConfig,
) -> anyhow::Result<Option<tokio::sync::mpsc::Sender<beehive::MeasurementBatch>>> {
    let (tx, rx) = tokio::sync::mpsc::channel(config.queue_size.max(1));
    let client = beehive::client::BeehiveClient::new(config)?;
    tokio::spawn(beehive::run_publisher_task(Arc::new(client), rx));
    info!("Beehive publishing enabled");
    Ok(Some(tx))
}

#[cfg(not(feature = "beehive"))]
fn spawn_beehive_task(
    config: config::BeehiveConfig,
) -> anyhow::Result<Option<tokio::sync::mpsc::Sender<beehive::MeasurementBatch>>> {
    warn!(
        "Beehive URL {} configured but beehive feature not enabled",
        config.url
    );
    Ok(None)
}
