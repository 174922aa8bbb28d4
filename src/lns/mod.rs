//! LoRa Network Server integrations
//!
//! Each supported LNS publishes uplinks as JSON over MQTT with its own
//! envelope and topic layout. A codec turns that envelope into a
//! [`RawUplink`]; [`UplinkParser`] then applies the rules shared by every
//! LNS (target device, field-tester ports, GPS extraction).
//!
//! Topic templates:
//! - ChirpStack v3/v4: `application/<app>/device/<devEUI>/event/up`,
//!   downlinks on `application/<app>/device/<devEUI>/command/down`
//! - The Things Stack v3: `v3/<app>[@<tenant>]/devices/<device-id>/up`,
//!   downlinks on `v3/<app>[@<tenant>]/devices/<device-id>/down/replace`
//!
//! Downlinks go to the topic the uplink came from with its trailing event
//! levels swapped, so tenant suffixes and other prefix levels survive.

pub mod chirpstack;
pub mod downlink;
pub mod tts;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::fieldtest::{
    DownlinkRecord, GatewayReception, GpsBlock, GpsFix, LnsRevision, Location, PayloadError,
    UplinkRecord, FIELD_TESTER_PORTS,
};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed uplink JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing mandatory field: {0}")]
    MissingField(&'static str),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid field-tester payload: {0}")]
    Payload(#[from] PayloadError),
}

/// Why a well-formed message produced no measurement
#[derive(Debug, Clone, PartialEq)]
pub enum IgnoreReason {
    /// Uplink from a device other than the configured one
    DeviceMismatch { received: String },
    /// Join, ack or other non-uplink event
    NotAnUplink,
    /// MAC-only frame without an application port
    NoPort,
    /// Port the field-tester firmware does not report on
    UnsupportedPort(u8),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::DeviceMismatch { received } => {
                write!(f, "uplink from other device {}", received)
            }
            IgnoreReason::NotAnUplink => write!(f, "not an uplink event"),
            IgnoreReason::NoPort => write!(f, "no application port"),
            IgnoreReason::UnsupportedPort(port) => write!(f, "unsupported port {}", port),
        }
    }
}

/// Result of parsing one MQTT message
#[derive(Debug, Clone, PartialEq)]
pub enum Uplink {
    Measurement(UplinkRecord),
    Ignored(IgnoreReason),
}

/// LNS uplink with the envelope stripped but no field-tester rules applied
#[derive(Debug, Clone, PartialEq)]
pub struct RawUplink {
    pub dev_eui: String,
    pub lns_device_id: String,
    pub application_id: Option<String>,
    pub revision: LnsRevision,
    pub received_at: Option<DateTime<Utc>>,
    pub f_port: Option<u8>,
    pub f_cnt: Option<u32>,
    pub payload: Vec<u8>,
    pub decoded: Option<serde_json::Value>,
    pub gateways: Vec<GatewayReception>,
}

impl RawUplink {
    /// Target may be given as DevEUI or, on TTS, as the device ID
    fn matches(&self, target: &str) -> bool {
        self.dev_eui.eq_ignore_ascii_case(target) || self.lns_device_id.eq_ignore_ascii_case(target)
    }
}

/// Wire format of one LNS
pub trait LnsCodec: Send + Sync {
    /// MQTT topic carrying uplinks of one device
    fn subscribe_topic(&self, device_eui: &str) -> String;

    /// Strip the LNS envelope; `Ok(None)` for events that are not uplinks
    fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<RawUplink>, ParseError>;

    /// Downlink topic derived from the topic an uplink arrived on; `None`
    /// when that topic is not concrete
    fn reply_topic(&self, uplink_topic: &str) -> Option<String>;

    /// MQTT topic accepting downlinks for one device
    fn downlink_topic(&self, application_id: &str, lns_device_id: &str) -> String;

    /// JSON body of a downlink request
    fn downlink_body(&self, record: &DownlinkRecord, f_port: u8, frm_payload: &str)
        -> serde_json::Value;
}

/// Supported network servers, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserVariant {
    ChirpStackV3Plus,
    TheThingsStackV3,
}

impl ParserVariant {
    pub fn codec(&self) -> &'static dyn LnsCodec {
        match self {
            ParserVariant::ChirpStackV3Plus => &chirpstack::ChirpStack,
            ParserVariant::TheThingsStackV3 => &tts::TheThingsStack,
        }
    }

    pub fn subscribe_topic(&self, device_eui: &str) -> String {
        self.codec().subscribe_topic(device_eui)
    }
}

impl FromStr for ParserVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ChirpStack_v3+" => Ok(ParserVariant::ChirpStackV3Plus),
            "TheThingsStack_v3" => Ok(ParserVariant::TheThingsStackV3),
            _ => Err(anyhow::anyhow!(
                "Unknown parser type {} (expected ChirpStack_v3+ or TheThingsStack_v3)",
                s
            )),
        }
    }
}

impl fmt::Display for ParserVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParserVariant::ChirpStackV3Plus => write!(f, "ChirpStack_v3+"),
            ParserVariant::TheThingsStackV3 => write!(f, "TheThingsStack_v3"),
        }
    }
}

/// Parses uplinks of the one configured device
#[derive(Debug, Clone)]
pub struct UplinkParser {
    variant: ParserVariant,
    device_eui: String,
}

impl UplinkParser {
    pub fn new(variant: ParserVariant, device_eui: impl Into<String>) -> Self {
        Self {
            variant,
            device_eui: device_eui.into(),
        }
    }

    pub fn variant(&self) -> ParserVariant {
        self.variant
    }

    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<Uplink, ParseError> {
        let raw = match self.variant.codec().decode(topic, payload)? {
            Some(raw) => raw,
            None => return Ok(Uplink::Ignored(IgnoreReason::NotAnUplink)),
        };

        if !raw.matches(&self.device_eui) {
            return Ok(Uplink::Ignored(IgnoreReason::DeviceMismatch {
                received: raw.dev_eui,
            }));
        }

        let f_port = match raw.f_port {
            None | Some(0) => return Ok(Uplink::Ignored(IgnoreReason::NoPort)),
            Some(port) if !FIELD_TESTER_PORTS.contains(&port) => {
                return Ok(Uplink::Ignored(IgnoreReason::UnsupportedPort(port)))
            }
            Some(port) => port,
        };

        // Protobuf JSON omits zero values, so the first frame has no counter
        let f_cnt = raw.f_cnt.unwrap_or(0);

        let device_location = match gps_from_decoded(raw.decoded.as_ref()) {
            Some(fix) => Some(fix),
            // An empty FRMPayload carries no GPS block at all
            None if raw.payload.is_empty() => None,
            None => GpsBlock::decode(&raw.payload)?.fix(),
        };

        Ok(Uplink::Measurement(UplinkRecord {
            device_id: raw.dev_eui.to_ascii_lowercase(),
            timestamp: raw.received_at.unwrap_or_else(Utc::now),
            device_location,
            gateways: raw.gateways,
            raw_payload: raw.payload,
            f_port,
            f_cnt,
            application_id: raw.application_id,
            lns_device_id: raw.lns_device_id,
            lns_revision: raw.revision,
            uplink_topic: topic.to_string(),
        }))
    }
}

/// Location object as both ChirpStack and TTS render it
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LocationJson {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl LocationJson {
    pub fn to_location(&self) -> Option<Location> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Location::new(lat, lon)),
            _ => None,
        }
    }
}

/// GPS fix from an LNS-side payload decoder (`object` / `decoded_payload`)
fn gps_from_decoded(decoded: Option<&serde_json::Value>) -> Option<GpsFix> {
    let object = decoded?.as_object()?;
    let latitude = object.get("latitude")?.as_f64()?;
    let longitude = object.get("longitude")?.as_f64()?;

    Some(GpsFix {
        position: Location::new(latitude, longitude),
        altitude: object.get("altitude").and_then(|v| v.as_f64()),
        hdop: object.get("hdop").and_then(|v| v.as_f64()),
        sats: object
            .get("sats")
            .and_then(|v| v.as_u64())
            .and_then(|v| u8::try_from(v).ok()),
    })
}

fn base64_decode(input: &str) -> Result<Vec<u8>, ParseError> {
    use base64::Engine;
    Ok(base64::engine::general_purpose::STANDARD.decode(input)?)
}

/// Concrete (non-wildcard) topic level at `index`
fn topic_level(topic: &str, index: usize) -> Option<String> {
    topic
        .split('/')
        .nth(index)
        .filter(|level| !level.is_empty() && *level != "+" && *level != "#")
        .map(str::to_string)
}

/// `topic` with `suffix` replaced by `replacement`, if the rest is wildcard-free
fn swap_topic_suffix(topic: &str, suffix: &str, replacement: &str) -> Option<String> {
    let prefix = topic.strip_suffix(suffix)?;
    if prefix.is_empty() || prefix.split('/').any(|level| level == "+" || level == "#") {
        return None;
    }
    Some(format!("{}{}", prefix, replacement))
}

fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Identifier that may arrive as a JSON string or number
fn id_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
