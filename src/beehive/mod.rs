//! Beehive measurement forwarding
//!
//! Every processed uplink yields a [`MeasurementBatch`]: the GPS fix the
//! device reported plus gateway distance and RSSI statistics. Batches are
//! queued by the pipeline and drained by [`run_publisher_task`] so a slow
//! sink never delays a downlink.

#[cfg(feature = "beehive")]
pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::fieldtest::{DownlinkRecord, UplinkRecord};
use crate::lns::ParserVariant;
use crate::pipeline::PublishError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub name: &'static str,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementBatch {
    pub measurements: Vec<Measurement>,
}

impl MeasurementBatch {
    /// Collect the measurements of one uplink; unknown values are left out
    pub fn from_records(
        uplink: &UplinkRecord,
        downlink: &DownlinkRecord,
        variant: ParserVariant,
    ) -> Self {
        let mut values: Vec<(&'static str, Option<f64>)> = Vec::new();

        if let Some(fix) = &uplink.device_location {
            values.extend([
                ("gps.hdop", fix.hdop),
                ("gps.sats", fix.sats.map(f64::from)),
                ("gps.latitude", Some(fix.position.latitude)),
                ("gps.longitude", Some(fix.position.longitude)),
                ("gps.altitude", fix.altitude),
                ("gps.accuracy", fix.accuracy()),
            ]);
        }

        values.extend([
            (
                "gateway.min_distance",
                downlink.best_distance_m.meters().map(f64::round),
            ),
            (
                "gateway.max_distance",
                downlink.worst_distance_m.meters().map(f64::round),
            ),
            ("gateway.min_rssi", downlink.rssi.map(|r| r.min)),
            ("gateway.max_rssi", downlink.rssi.map(|r| r.max)),
            ("gateway.num_gateways", Some(downlink.gateway_count as f64)),
        ]);

        if downlink.best_distance_m.is_known() {
            values.push((
                "coverage.level",
                Some(f64::from(downlink.coverage_level.code())),
            ));
        }

        let mut meta = BTreeMap::new();
        meta.insert("device".to_string(), uplink.device_id.clone());
        meta.insert("parser".to_string(), variant.to_string());
        meta.insert("f_cnt".to_string(), uplink.f_cnt.to_string());

        let measurements = values
            .into_iter()
            .filter_map(|(name, value)| {
                value.map(|value| Measurement {
                    name,
                    value,
                    timestamp: uplink.timestamp,
                    meta: meta.clone(),
                })
            })
            .collect();

        Self { measurements }
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

/// Destination for measurement batches
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn publish(&self, batch: &MeasurementBatch) -> Result<(), PublishError>;
}

/// Attempts per batch before it is dropped
const MAX_ATTEMPTS: u32 = 3;

/// Background task draining the measurement queue into a sink
pub async fn run_publisher_task(
    sink: Arc<dyn MeasurementSink>,
    mut rx: mpsc::Receiver<MeasurementBatch>,
) {
    info!("Beehive publisher started");

    while let Some(batch) = rx.recv().await {
        if batch.is_empty() {
            continue;
        }

        let mut attempt = 0u32;
        loop {
            match sink.publish(&batch).await {
                Ok(()) => {
                    debug!("Published {} measurements to Beehive", batch.len());
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        error!(
                            "Dropping {} measurements after {} attempts: {}",
                            batch.len(),
                            attempt,
                            e
                        );
                        break;
                    }
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!(
                        "Beehive publish attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempt, MAX_ATTEMPTS, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    info!("Measurement channel closed, Beehive publisher stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::{CoverageCalculator, CoverageThresholds};
    use crate::fieldtest::encoder::FrameFormat;
    use crate::fieldtest::{GatewayReception, GpsFix, LnsRevision, Location};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn uplink(fix: bool) -> UplinkRecord {
        UplinkRecord {
            device_id: "70b3d57ed005a1b2".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            device_location: fix.then(|| GpsFix {
                position: Location::new(1.0, 1.0),
                altitude: Some(120.0),
                hdop: Some(1.0),
                sats: Some(8),
            }),
            gateways: vec![
                GatewayReception {
                    gateway_id: "gw-1".to_string(),
                    location: Some(Location::new(1.0, 1.018)),
                    rssi: Some(-97.0),
                    snr: Some(5.5),
                },
                GatewayReception {
                    gateway_id: "gw-2".to_string(),
                    location: None,
                    rssi: Some(-112.0),
                    snr: Some(-3.0),
                },
            ],
            raw_payload: Vec::new(),
            f_port: 1,
            f_cnt: 42,
            application_id: Some("3".to_string()),
            lns_device_id: "70b3d57ed005a1b2".to_string(),
            lns_revision: LnsRevision::ChirpStackV4,
            uplink_topic: "application/3/device/70b3d57ed005a1b2/event/up".to_string(),
        }
    }

    fn batch(fix: bool) -> MeasurementBatch {
        let uplink = uplink(fix);
        let downlink =
            CoverageCalculator::new(CoverageThresholds::default(), FrameFormat::Coverage)
                .compute(&uplink);
        MeasurementBatch::from_records(&uplink, &downlink, ParserVariant::ChirpStackV3Plus)
    }

    fn value(batch: &MeasurementBatch, name: &str) -> Option<f64> {
        batch
            .measurements
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value)
    }

    #[test]
    fn test_batch_with_fix() {
        let batch = batch(true);

        assert_eq!(value(&batch, "gps.sats"), Some(8.0));
        assert_eq!(value(&batch, "gps.altitude"), Some(120.0));
        assert_eq!(value(&batch, "gateway.min_rssi"), Some(-112.0));
        assert_eq!(value(&batch, "gateway.max_rssi"), Some(-97.0));
        assert_eq!(value(&batch, "gateway.num_gateways"), Some(2.0));
        assert_eq!(value(&batch, "coverage.level"), Some(2.0));

        let min = value(&batch, "gateway.min_distance").unwrap();
        assert_eq!(min, min.round());
        assert!((min - 2001.0).abs() <= 1.0);

        let m = &batch.measurements[0];
        assert_eq!(m.meta["device"], "70b3d57ed005a1b2");
        assert_eq!(m.meta["parser"], "ChirpStack_v3+");
        assert_eq!(m.meta["f_cnt"], "42");
    }

    #[test]
    fn test_batch_without_fix_omits_unknowns() {
        let batch = batch(false);

        assert_eq!(value(&batch, "gps.latitude"), None);
        assert_eq!(value(&batch, "gateway.min_distance"), None);
        assert_eq!(value(&batch, "coverage.level"), None);
        assert_eq!(value(&batch, "gateway.num_gateways"), Some(2.0));
        assert_eq!(value(&batch, "gateway.min_rssi"), Some(-112.0));
    }

    #[test]
    fn test_batch_serializes() {
        let json = serde_json::to_value(batch(true)).unwrap();
        let first = &json["measurements"][0];
        assert_eq!(first["name"], "gps.hdop");
        assert_eq!(first["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<MeasurementBatch>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MeasurementSink for RecordingSink {
        async fn publish(&self, batch: &MeasurementBatch) -> Result<(), PublishError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(PublishError::Rejected(503));
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_task_retries_then_delivers() {
        let sink = Arc::new(RecordingSink {
            failures_left: AtomicUsize::new(1),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);

        tx.send(batch(true)).await.unwrap();
        tx.send(MeasurementBatch {
            measurements: Vec::new(),
        })
        .await
        .unwrap();
        drop(tx);

        run_publisher_task(sink.clone(), rx).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], batch(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_task_drops_after_max_attempts() {
        let sink = Arc::new(RecordingSink {
            failures_left: AtomicUsize::new(10),
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);
        tx.send(batch(false)).await.unwrap();
        drop(tx);

        run_publisher_task(sink.clone(), rx).await;

        assert!(sink.batches.lock().unwrap().is_empty());
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 10 - MAX_ATTEMPTS as usize);
    }
}
