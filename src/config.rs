use serde::Deserialize;
use std::path::Path;

use crate::coverage::CoverageThresholds;
use crate::fieldtest::encoder::FrameFormat;
use crate::lns::ParserVariant;

/// Optional TOML file for settings that have no command-line flag
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub coverage: CoverageThresholds,
    pub mqtt: MqttConfig,
    pub beehive: Option<BeehiveConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Consecutive connection failures before giving up (0 = never)
    pub max_reconnect_attempts: u32,
    /// Capacity of the client request queue
    pub channel_capacity: usize,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "field-tester-relay".to_string(),
            keep_alive_secs: 30,
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 10,
            channel_capacity: 64,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BeehiveConfig {
    pub url: String,
    #[serde(default = "default_beehive_timeout")]
    pub timeout_secs: u64,
    /// Batches waiting for the publisher before new ones are dropped
    #[serde(default = "default_beehive_queue")]
    pub queue_size: usize,
}

fn default_beehive_timeout() -> u64 {
    10
}

fn default_beehive_queue() -> usize {
    64
}

impl BeehiveConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            timeout_secs: default_beehive_timeout(),
            queue_size: default_beehive_queue(),
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: FileConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

/// Broker address plus client settings
#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub settings: MqttConfig,
}

/// Immutable process-wide settings handed to the pipeline
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Target DevEUI (or TTS device ID) as given on the command line
    pub device_eui: String,
    pub parser_variant: ParserVariant,
    pub subscribe_topic: String,
    pub frame_format: FrameFormat,
    pub thresholds: CoverageThresholds,
    /// Forward measurements to Beehive
    pub publish: bool,
}

impl RelayConfig {
    pub fn new(
        device_eui: &str,
        parser_variant: ParserVariant,
        subscribe_topic: Option<String>,
        frame_format: FrameFormat,
        thresholds: CoverageThresholds,
        publish: bool,
    ) -> anyhow::Result<Self> {
        let device_eui = device_eui.trim();
        let subscribe_topic = subscribe_topic
            .filter(|topic| !topic.trim().is_empty())
            .unwrap_or_else(|| parser_variant.subscribe_topic(device_eui));

        let config = Self {
            device_eui: device_eui.to_string(),
            parser_variant,
            subscribe_topic,
            frame_format,
            thresholds,
            publish,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device_eui.is_empty() {
            anyhow::bail!("device-devui must be passed, see --help or plugin documentation");
        }
        if self.device_eui.contains(['+', '#', '/']) {
            anyhow::bail!("device-devui {:?} contains MQTT topic characters", self.device_eui);
        }
        self.thresholds.validate()
    }
}

/// Map a numeric logging level (10=DEBUG .. 50=CRITICAL) to a filter directive
pub fn level_filter(level: u8) -> &'static str {
    match level {
        0..=9 => "trace",
        10 => "debug",
        11..=20 => "info",
        21..=30 => "warn",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_topic_is_derived() {
        let config = RelayConfig::new(
            "70b3d57ed005a1b2",
            ParserVariant::TheThingsStackV3,
            None,
            FrameFormat::Coverage,
            CoverageThresholds::default(),
            false,
        )
        .unwrap();
        assert_eq!(config.subscribe_topic, "v3/+/devices/70b3d57ed005a1b2/up");
    }

    #[test]
    fn test_subscribe_topic_override() {
        let config = RelayConfig::new(
            "70b3d57ed005a1b2",
            ParserVariant::ChirpStackV3Plus,
            Some("application/7/device/+/event/up".to_string()),
            FrameFormat::Coverage,
            CoverageThresholds::default(),
            false,
        )
        .unwrap();
        assert_eq!(config.subscribe_topic, "application/7/device/+/event/up");
    }

    #[test]
    fn test_rejects_missing_device_and_bad_thresholds() {
        assert!(RelayConfig::new(
            "  ",
            ParserVariant::ChirpStackV3Plus,
            None,
            FrameFormat::Coverage,
            CoverageThresholds::default(),
            false,
        )
        .is_err());

        assert!(RelayConfig::new(
            "70b3d57ed005a1b2",
            ParserVariant::ChirpStackV3Plus,
            None,
            FrameFormat::Coverage,
            CoverageThresholds {
                good_max_m: 3_000.0,
                fair_max_m: 1_000.0,
            },
            false,
        )
        .is_err());

        assert!(RelayConfig::new(
            "+",
            ParserVariant::ChirpStackV3Plus,
            None,
            FrameFormat::Coverage,
            CoverageThresholds::default(),
            false,
        )
        .is_err());
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(10), "debug");
        assert_eq!(level_filter(20), "info");
        assert_eq!(level_filter(30), "warn");
        assert_eq!(level_filter(40), "error");
        assert_eq!(level_filter(50), "error");
    }

    #[test]
    fn test_parse_file_config() {
        let config: FileConfig = toml::from_str(
            r#"
            [coverage]
            good_max_m = 1500.0

            [mqtt]
            keep_alive_secs = 60

            [beehive]
            url = "http://beehive.local/api/measurements"
            "#,
        )
        .unwrap();

        assert_eq!(config.coverage.good_max_m, 1500.0);
        assert_eq!(config.coverage.fair_max_m, 5000.0);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.mqtt.reconnect_delay_secs, 5);
        let beehive = config.beehive.unwrap();
        assert_eq!(beehive.timeout_secs, 10);
        assert_eq!(beehive.queue_size, 64);
    }

    #[test]
    fn test_empty_file_config() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert_eq!(config.coverage, CoverageThresholds::default());
        assert!(config.beehive.is_none());
    }
}
