//! Downlink frame encoder
//!
//! Builds the application bytes the field tester displays. The output is
//! base64-encoded and wrapped in the LNS downlink envelope.
//!
//! `coverage` frame (3 bytes):
//!   Status(1) | BestDistance(2,BE, meters, 0xFFFF = unknown)
//!
//!   Status: bit0 FIX | bit1 NO_FIX | bit2 SATURATED | bit3 NO_GATEWAY_LOCATION
//!           bits4-5 coverage level (0 unknown, 1 poor, 2 fair, 3 good)
//!
//! `field-tester` frames follow the stock firmware, selected by uplink port:
//!   port 1:  Seq(1) | MinRSSI(1) | MaxRSSI(1) | MinDist(1, 250 m) | MaxDist(1, 250 m) | Gateways(1)
//!   port 11: Seq(1) | MinRSSI(1) | MaxRSSI(1) | MinDist(2,BE, 10 m) | MaxDist(2,BE, 10 m) | Gateways(1)

use bytes::{BufMut, BytesMut};

use super::{CoverageLevel, Distance, DownlinkRecord, RssiRange};
#[cfg(test)]
use super::PayloadError;

/// Status flag bits of the `coverage` frame
pub mod status {
    pub const FIX: u8 = 0x01;
    pub const NO_FIX: u8 = 0x02;
    pub const SATURATED: u8 = 0x04;
    pub const NO_GATEWAY_LOCATION: u8 = 0x08;
    pub const COVERAGE_SHIFT: u8 = 4;
    #[cfg(test)]
    pub const COVERAGE_MASK: u8 = 0x30;
}

/// Distance value reserved for "unknown"
pub const UNKNOWN_DISTANCE: u16 = 0xFFFF;

/// Largest distance a `coverage` frame can carry
pub const MAX_DISTANCE: u16 = 0xFFFE;

pub const COVERAGE_FRAME_LEN: usize = 3;

/// Uplink port that selects the extended firmware layout
const EXTENDED_PORT: u8 = 11;

/// Device frame layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FrameFormat {
    /// Status byte + 16-bit best distance
    #[default]
    Coverage,
    /// Stock field-tester firmware layout (depends on uplink port)
    FieldTester,
}

/// Inputs for one downlink frame
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pub format: FrameFormat,
    pub f_port: u8,
    pub f_cnt: u32,
    pub has_fix: bool,
    pub best_distance: Distance,
    pub worst_distance: Distance,
    pub coverage_level: CoverageLevel,
    pub rssi: Option<RssiRange>,
    pub gateway_count: usize,
}

impl FrameBuilder {
    /// Collect the frame inputs from a computed downlink record
    pub fn from_record(format: FrameFormat, record: &DownlinkRecord) -> Self {
        Self {
            format,
            f_port: record.f_port,
            f_cnt: record.f_cnt,
            has_fix: record.has_fix,
            best_distance: record.best_distance_m,
            worst_distance: record.worst_distance_m,
            coverage_level: record.coverage_level,
            rssi: record.rssi,
            gateway_count: record.gateway_count,
        }
    }

    /// Build the raw frame bytes
    pub fn build(&self) -> Vec<u8> {
        match self.format {
            FrameFormat::Coverage => self.build_coverage(),
            FrameFormat::FieldTester => self.build_field_tester(),
        }
    }

    fn build_coverage(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(COVERAGE_FRAME_LEN);

        let mut flags = if self.has_fix {
            status::FIX
        } else {
            status::NO_FIX
        };

        let distance = match (self.has_fix, self.best_distance) {
            (true, Distance::Meters(m)) => {
                let rounded = m.round();
                if rounded > MAX_DISTANCE as f64 {
                    flags |= status::SATURATED;
                    MAX_DISTANCE
                } else {
                    rounded.max(0.0) as u16
                }
            }
            (true, Distance::Unknown) => {
                flags |= status::NO_GATEWAY_LOCATION;
                UNKNOWN_DISTANCE
            }
            (false, _) => UNKNOWN_DISTANCE,
        };

        let level = if self.has_fix {
            self.coverage_level
        } else {
            CoverageLevel::Unknown
        };
        flags |= level.code() << status::COVERAGE_SHIFT;

        buf.put_u8(flags);
        buf.put_u16(distance);
        buf.to_vec()
    }

    fn build_field_tester(&self) -> Vec<u8> {
        let extended = self.f_port == EXTENDED_PORT;
        let mut buf = BytesMut::with_capacity(if extended { 8 } else { 6 });

        buf.put_u8((self.f_cnt % 256) as u8);
        buf.put_u8(rssi_byte(self.rssi.map(|r| r.min)));
        buf.put_u8(rssi_byte(self.rssi.map(|r| r.max)));

        if extended {
            buf.put_u16(scaled_distance(self.best_distance, 10.0, 65535.0));
            buf.put_u16(scaled_distance(self.worst_distance, 10.0, 65535.0));
        } else {
            buf.put_u8(scaled_distance(self.best_distance, 250.0, 128.0) as u8);
            buf.put_u8(scaled_distance(self.worst_distance, 250.0, 128.0) as u8);
        }

        buf.put_u8((self.gateway_count % 256) as u8);
        buf.to_vec()
    }
}

/// RSSI shifted by +200 dBm into one byte; missing RSSI is 0 (-200 dBm)
fn rssi_byte(rssi: Option<f64>) -> u8 {
    match rssi {
        Some(value) => ((value + 200.0) as i64).rem_euclid(256) as u8,
        None => 0,
    }
}

/// Known distances clamp to `1..=max` units, so 0 stays free for "no data"
fn scaled_distance(distance: Distance, unit_m: f64, max: f64) -> u16 {
    match distance {
        Distance::Meters(m) => (m / unit_m).round().clamp(1.0, max) as u16,
        Distance::Unknown => 0,
    }
}

/// Decoded `coverage` frame, the device-side view used to check encoder output
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageFrame {
    pub flags: u8,
    pub distance: Distance,
    pub coverage_level: CoverageLevel,
}

#[cfg(test)]
impl CoverageFrame {
    pub fn parse(data: &[u8]) -> Result<Self, PayloadError> {
        use bytes::Buf;

        if data.len() != COVERAGE_FRAME_LEN {
            return Err(PayloadError::FrameLength(data.len()));
        }

        let mut buf = data;
        let flags = buf.get_u8();
        let raw = buf.get_u16();

        let distance = if raw == UNKNOWN_DISTANCE {
            Distance::Unknown
        } else {
            Distance::Meters(raw as f64)
        };

        Ok(Self {
            flags,
            distance,
            coverage_level: CoverageLevel::from_code(
                (flags & status::COVERAGE_MASK) >> status::COVERAGE_SHIFT,
            ),
        })
    }

    pub fn has_fix(&self) -> bool {
        self.flags & status::FIX != 0
    }

    pub fn is_saturated(&self) -> bool {
        self.flags & status::SATURATED != 0
    }
}
