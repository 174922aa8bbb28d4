//! Distance and coverage computation
//!
//! Great-circle (haversine) distance from the device fix to every gateway
//! that reported a location, classified against explicit thresholds.

use serde::Deserialize;

use crate::fieldtest::encoder::{FrameBuilder, FrameFormat};
use crate::fieldtest::{CoverageLevel, Distance, DownlinkRecord, Location, RssiRange, UplinkRecord};

/// Mean Earth radius in meters (spherical model)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points, in meters
pub fn haversine_m(a: Location, b: Location) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Distance bands used to grade coverage
///
/// `< good_max_m` is GOOD, `good_max_m..=fair_max_m` is FAIR, anything
/// further is POOR.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoverageThresholds {
    pub good_max_m: f64,
    pub fair_max_m: f64,
}

impl Default for CoverageThresholds {
    fn default() -> Self {
        Self {
            good_max_m: 2_000.0,
            fair_max_m: 5_000.0,
        }
    }
}

impl CoverageThresholds {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.good_max_m.is_finite() && self.fair_max_m.is_finite()) {
            anyhow::bail!("coverage thresholds must be finite");
        }
        if self.good_max_m <= 0.0 || self.fair_max_m <= self.good_max_m {
            anyhow::bail!(
                "coverage thresholds must satisfy 0 < good ({}) < fair ({})",
                self.good_max_m,
                self.fair_max_m
            );
        }
        Ok(())
    }

    pub fn classify(&self, distance: Distance) -> CoverageLevel {
        match distance {
            Distance::Unknown => CoverageLevel::Unknown,
            Distance::Meters(m) if m < self.good_max_m => CoverageLevel::Good,
            Distance::Meters(m) if m <= self.fair_max_m => CoverageLevel::Fair,
            Distance::Meters(_) => CoverageLevel::Poor,
        }
    }
}

/// Turns uplink records into downlink records
#[derive(Debug, Clone)]
pub struct CoverageCalculator {
    thresholds: CoverageThresholds,
    format: FrameFormat,
}

impl CoverageCalculator {
    pub fn new(thresholds: CoverageThresholds, format: FrameFormat) -> Self {
        Self { thresholds, format }
    }

    pub fn compute(&self, uplink: &UplinkRecord) -> DownlinkRecord {
        let distances: Vec<f64> = match &uplink.device_location {
            Some(fix) => uplink
                .gateways
                .iter()
                .filter_map(|gw| gw.location)
                .map(|gw_location| haversine_m(fix.position, gw_location))
                .collect(),
            None => Vec::new(),
        };

        let best = distances
            .iter()
            .copied()
            .reduce(f64::min)
            .map_or(Distance::Unknown, Distance::Meters);
        let worst = distances
            .iter()
            .copied()
            .reduce(f64::max)
            .map_or(Distance::Unknown, Distance::Meters);

        let rssi = uplink
            .gateways
            .iter()
            .filter_map(|gw| gw.rssi)
            .fold(None, |range: Option<RssiRange>, value| {
                Some(match range {
                    Some(r) => RssiRange {
                        min: r.min.min(value),
                        max: r.max.max(value),
                    },
                    None => RssiRange {
                        min: value,
                        max: value,
                    },
                })
            });

        let mut record = DownlinkRecord {
            device_id: uplink.device_id.clone(),
            best_distance_m: best,
            worst_distance_m: worst,
            coverage_level: self.thresholds.classify(best),
            rssi,
            gateway_count: uplink.gateways.len(),
            has_fix: uplink.device_location.is_some(),
            f_port: uplink.f_port,
            f_cnt: uplink.f_cnt,
            application_id: uplink.application_id.clone(),
            lns_device_id: uplink.lns_device_id.clone(),
            lns_revision: uplink.lns_revision,
            uplink_topic: uplink.uplink_topic.clone(),
            encoded_payload: Vec::new(),
        };
        record.encoded_payload = FrameBuilder::from_record(self.format, &record).build();
        record
    }
}
