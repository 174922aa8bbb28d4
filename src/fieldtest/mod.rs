//! Field Tester measurement model
//!
//! Normalized uplink/downlink records shared by every LNS parser, plus the
//! decoder for the field-tester binary GPS block.
//!
//! Uplink GPS block (application ports 1 and 11, at least 10 bytes):
//!   LatLon(6) | Altitude(2,BE, +1000 m) | HDOP(1, x10) | Sats(1)

pub mod encoder;

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Application ports the field-tester firmware reports on
pub const FIELD_TESTER_PORTS: [u8; 2] = [1, 11];

/// Size of the binary GPS block at the start of a field-tester uplink
pub const GPS_BLOCK_LEN: usize = 10;

/// A binary fix is only trusted with HDOP at or below this value
pub const MAX_FIX_HDOP: f64 = 2.0;

/// ...and with at least this many satellites in view
pub const MIN_FIX_SATS: u8 = 5;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[cfg(test)]
    #[error("unexpected frame length: {0} bytes")]
    FrameLength(usize),
}

/// Latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// GPS fix reported by the device
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub position: Location,
    /// Meters above sea level
    pub altitude: Option<f64>,
    pub hdop: Option<f64>,
    pub sats: Option<u8>,
}

impl GpsFix {
    /// Horizontal accuracy estimate in meters, derived from HDOP
    pub fn accuracy(&self) -> Option<f64> {
        self.hdop.map(|hdop| (hdop * 5.0 + 5.0) / 10.0)
    }
}

/// One gateway that received the uplink
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReception {
    pub gateway_id: String,
    pub location: Option<Location>,
    /// RSSI in dBm
    pub rssi: Option<f64>,
    /// Signal-to-noise ratio in dB
    pub snr: Option<f64>,
}

/// Which network server flavour produced an uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LnsRevision {
    ChirpStackV3,
    ChirpStackV4,
    TheThingsStackV3,
}

impl fmt::Display for LnsRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LnsRevision::ChirpStackV3 => write!(f, "ChirpStack v3"),
            LnsRevision::ChirpStackV4 => write!(f, "ChirpStack v4"),
            LnsRevision::TheThingsStackV3 => write!(f, "The Things Stack v3"),
        }
    }
}

/// One decoded field-test report
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkRecord {
    /// DevEUI, lowercase hex
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_location: Option<GpsFix>,
    pub gateways: Vec<GatewayReception>,
    /// Decoded application payload (FRMPayload)
    pub raw_payload: Vec<u8>,
    pub f_port: u8,
    pub f_cnt: u32,
    pub application_id: Option<String>,
    /// Device identifier used in LNS topics
    pub lns_device_id: String,
    pub lns_revision: LnsRevision,
    /// Topic the uplink arrived on; the reply topic is derived from it
    pub uplink_topic: String,
}

/// Distance with an explicit "unknown" value
///
/// Zero meters means "at the gateway"; a missing fix or missing gateway
/// location is always `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distance {
    Meters(f64),
    Unknown,
}

impl Distance {
    pub fn meters(&self) -> Option<f64> {
        match self {
            Distance::Meters(m) => Some(*m),
            Distance::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Distance::Meters(_))
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distance::Meters(m) => write!(f, "{:.0} m", m),
            Distance::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoverageLevel {
    Unknown,
    Poor,
    Fair,
    Good,
}

impl CoverageLevel {
    /// 2-bit code carried in the downlink status byte
    pub fn code(&self) -> u8 {
        match self {
            CoverageLevel::Unknown => 0,
            CoverageLevel::Poor => 1,
            CoverageLevel::Fair => 2,
            CoverageLevel::Good => 3,
        }
    }

    #[cfg(test)]
    pub fn from_code(code: u8) -> Self {
        match code & 0x03 {
            1 => CoverageLevel::Poor,
            2 => CoverageLevel::Fair,
            3 => CoverageLevel::Good,
            _ => CoverageLevel::Unknown,
        }
    }
}

impl fmt::Display for CoverageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageLevel::Unknown => write!(f, "UNKNOWN"),
            CoverageLevel::Poor => write!(f, "POOR"),
            CoverageLevel::Fair => write!(f, "FAIR"),
            CoverageLevel::Good => write!(f, "GOOD"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RssiRange {
    pub min: f64,
    pub max: f64,
}

/// Coverage result for one uplink, ready to be sent back to the device
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkRecord {
    pub device_id: String,
    pub best_distance_m: Distance,
    pub worst_distance_m: Distance,
    pub coverage_level: CoverageLevel,
    pub rssi: Option<RssiRange>,
    pub gateway_count: usize,
    pub has_fix: bool,
    /// Port and counter of the uplink this answers
    pub f_port: u8,
    pub f_cnt: u32,
    pub application_id: Option<String>,
    pub lns_device_id: String,
    pub lns_revision: LnsRevision,
    pub uplink_topic: String,
    /// Device application bytes (see [`encoder`])
    pub encoded_payload: Vec<u8>,
}

/// Raw contents of the field-tester binary GPS block
#[derive(Debug, Clone, PartialEq)]
pub struct GpsBlock {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub hdop: f64,
    pub sats: u8,
}

impl GpsBlock {
    /// Decode the GPS block from the start of a field-tester payload
    pub fn decode(data: &[u8]) -> Result<Self, PayloadError> {
        if data.len() < GPS_BLOCK_LEN {
            return Err(PayloadError::TooShort {
                expected: GPS_BLOCK_LEN,
                actual: data.len(),
            });
        }

        let lon_sign = if (data[0] >> 7) & 0x01 == 1 { -1.0 } else { 1.0 };
        let lat_sign = if (data[0] >> 6) & 0x01 == 1 { -1.0 } else { 1.0 };

        // 23-bit magnitudes packed across bytes 0..6
        let enc_lat = ((data[0] as u32 & 0x3f) << 17)
            | ((data[1] as u32) << 9)
            | ((data[2] as u32) << 1)
            | (data[3] as u32 >> 7);
        let enc_lon = ((data[3] as u32 & 0x7f) << 16) | ((data[4] as u32) << 8) | data[5] as u32;

        let latitude = lat_sign * (enc_lat as f64 * 108.0 + 53.0) / 10_000_000.0;
        let longitude = lon_sign * (enc_lon as f64 * 215.0 + 107.0) / 10_000_000.0;
        let altitude = u16::from_be_bytes([data[6], data[7]]) as f64 - 1000.0;
        let hdop = data[8] as f64 / 10.0;
        let sats = data[9];

        Ok(Self {
            latitude,
            longitude,
            altitude,
            hdop,
            sats,
        })
    }

    /// Whether the receiver had a usable fix when the block was written
    pub fn has_fix(&self) -> bool {
        self.hdop <= MAX_FIX_HDOP && self.sats >= MIN_FIX_SATS
    }

    /// Convert to a [`GpsFix`], or `None` when the fix is not usable
    pub fn fix(&self) -> Option<GpsFix> {
        if !self.has_fix() {
            return None;
        }
        Some(GpsFix {
            position: Location::new(self.latitude, self.longitude),
            altitude: Some(self.altitude),
            hdop: Some(self.hdop),
            sats: Some(self.sats),
        })
    }
}
