//! Per-message relay pipeline
//!
//! Each inbound MQTT message walks `Parsing -> Computing -> Encoding ->
//! Publishing` and ends in exactly one [`PipelineOutcome`]. A failure at any
//! stage is logged and the pipeline returns to idle for the next message.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

use crate::beehive::MeasurementBatch;
use crate::config::RelayConfig;
use crate::coverage::CoverageCalculator;
use crate::fieldtest::DownlinkRecord;
use crate::lns::downlink::{DownlinkEncoder, EncodeError};
use crate::lns::{IgnoreReason, ParseError, Uplink, UplinkParser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Parsing,
    Computing,
    Encoding,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Parsing => "parsing",
            Stage::Computing => "computing",
            Stage::Encoding => "encoding",
            Stage::Publishing => "publishing",
        };
        f.write_str(name)
    }
}

/// Failure reported by an outbound transport (MQTT or Beehive)
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("sink rejected batch with status {0}")]
    Rejected(u16),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Sends an encoded downlink to the broker
#[async_trait]
pub trait DownlinkPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Published {
        topic: String,
        record: DownlinkRecord,
    },
    Ignored(IgnoreReason),
    Failed {
        stage: Stage,
        error: PipelineError,
    },
}

impl PipelineOutcome {
    fn failed(stage: Stage, error: impl Into<PipelineError>) -> Self {
        PipelineOutcome::Failed {
            stage,
            error: error.into(),
        }
    }
}

pub struct Pipeline {
    config: Arc<RelayConfig>,
    parser: UplinkParser,
    calculator: CoverageCalculator,
    publisher: Arc<dyn DownlinkPublisher>,
    beehive: Option<mpsc::Sender<MeasurementBatch>>,
}

impl Pipeline {
    pub fn new(config: Arc<RelayConfig>, publisher: Arc<dyn DownlinkPublisher>) -> Self {
        let parser = UplinkParser::new(config.parser_variant, config.device_eui.clone());
        let calculator = CoverageCalculator::new(config.thresholds, config.frame_format);
        Self {
            config,
            parser,
            calculator,
            publisher,
            beehive: None,
        }
    }

    /// Forward measurements of every processed uplink to this queue
    pub fn with_beehive(mut self, tx: mpsc::Sender<MeasurementBatch>) -> Self {
        self.beehive = Some(tx);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> PipelineOutcome {
        let span = tracing::info_span!("uplink", topic = %topic, bytes = payload.len());
        let outcome = self.process(topic, payload).instrument(span).await;
        debug!(stage = %Stage::Idle, "Waiting for next uplink");
        outcome
    }

    async fn process(&self, topic: &str, payload: &[u8]) -> PipelineOutcome {
        debug!(stage = %Stage::Parsing, "Decoding uplink");
        let uplink = match self.parser.parse(topic, payload) {
            Ok(Uplink::Measurement(record)) => record,
            Ok(Uplink::Ignored(reason)) => {
                debug!("Ignoring message: {}", reason);
                return PipelineOutcome::Ignored(reason);
            }
            Err(e) => {
                error!(stage = %Stage::Parsing, "Failed to parse uplink: {}", e);
                return PipelineOutcome::failed(Stage::Parsing, e);
            }
        };

        debug!("Received: 0x{}", hex::encode(&uplink.raw_payload));
        info!(
            "Uplink from {} fCnt={} fPort={} gateways={} fix={}",
            uplink.device_id,
            uplink.f_cnt,
            uplink.f_port,
            uplink.gateways.len(),
            uplink.device_location.is_some()
        );

        debug!(stage = %Stage::Computing, "Computing coverage");
        let record = self.calculator.compute(&uplink);
        info!(
            "Coverage {} best={} worst={}",
            record.coverage_level, record.best_distance_m, record.worst_distance_m
        );

        if self.config.publish {
            self.forward_measurements(MeasurementBatch::from_records(
                &uplink,
                &record,
                self.parser.variant(),
            ));
        }

        debug!(stage = %Stage::Encoding, "Encoding downlink");
        let downlink = match DownlinkEncoder::encode(&record, self.parser.variant()) {
            Ok(downlink) => downlink,
            Err(e) => {
                error!(stage = %Stage::Encoding, "Failed to encode downlink: {}", e);
                return PipelineOutcome::failed(Stage::Encoding, e);
            }
        };

        debug!(
            stage = %Stage::Publishing,
            "Publishing {} byte frame {} on port {}",
            record.encoded_payload.len(),
            hex::encode(&record.encoded_payload),
            downlink.f_port
        );
        if let Err(e) = self
            .publisher
            .publish(&downlink.topic, downlink.payload)
            .await
        {
            error!(stage = %Stage::Publishing, "Failed to publish downlink: {}", e);
            return PipelineOutcome::failed(Stage::Publishing, e);
        }

        info!("Downlink queued on {}", downlink.topic);
        PipelineOutcome::Published {
            topic: downlink.topic,
            record,
        }
    }

    fn forward_measurements(&self, batch: MeasurementBatch) {
        let tx = match &self.beehive {
            Some(tx) => tx,
            None => return,
        };
        match tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Beehive queue full, dropping measurements");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Beehive publisher stopped, dropping measurements");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageThresholds;
    use crate::fieldtest::encoder::{status, CoverageFrame, FrameFormat, UNKNOWN_DISTANCE};
    use crate::fieldtest::{CoverageLevel, Distance};
    use crate::lns::tests::{b64, gps_payload, no_fix_payload, DEV_EUI};
    use crate::lns::ParserVariant;
    use serde_json::Value;
    use std::sync::Mutex;

    const TOPIC: &str = "application/3/device/70b3d57ed005a1b2/event/up";

    /// Records published downlinks, optionally failing every call
    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl DownlinkPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Transport("broker unreachable".to_string()));
            }
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn config(publish: bool) -> Arc<RelayConfig> {
        config_for(ParserVariant::ChirpStackV3Plus, DEV_EUI, FrameFormat::Coverage, publish)
    }

    fn config_for(
        variant: ParserVariant,
        device: &str,
        format: FrameFormat,
        publish: bool,
    ) -> Arc<RelayConfig> {
        Arc::new(
            RelayConfig::new(
                device,
                variant,
                None,
                format,
                CoverageThresholds::default(),
                publish,
            )
            .unwrap(),
        )
    }

    fn uplink_json(data: &[u8], gateway_longitude: f64) -> String {
        format!(
            r#"{{"time":"2024-05-01T12:00:00Z",
                "deviceInfo":{{"applicationId":"3","devEui":"{}"}},
                "fCnt":42,"fPort":1,"data":"{}",
                "rxInfo":[{{"gatewayId":"gw-1","rssi":-97,"snr":5.5,
                            "location":{{"latitude":1.0,"longitude":{}}}}}]}}"#,
            DEV_EUI,
            b64(data),
            gateway_longitude
        )
    }

    fn tts_uplink_json(data: &[u8]) -> String {
        format!(
            r#"{{"end_device_ids":{{"device_id":"ft-01","dev_eui":"{}",
                    "application_ids":{{"application_id":"field-test"}}}},
                "received_at":"2024-05-01T12:00:00Z",
                "uplink_message":{{"f_port":1,"f_cnt":42,"frm_payload":"{}",
                    "rx_metadata":[{{"gateway_ids":{{"gateway_id":"gw-1"}},"rssi":-97,"snr":5.5,
                        "location":{{"latitude":1.0,"longitude":1.018}}}}]}}}}"#,
            DEV_EUI.to_uppercase(),
            b64(data)
        )
    }

    fn base64_frame(data: &Value) -> Vec<u8> {
        let data = data.as_str().unwrap();
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data).unwrap()
    }

    fn downlink_frame(payload: &[u8]) -> Vec<u8> {
        let body: Value = serde_json::from_slice(payload).unwrap();
        base64_frame(&body["data"])
    }

    #[test]
    fn test_two_km_uplink_publishes_fair_downlink() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = Pipeline::new(config(false), publisher.clone());

        let outcome = tokio_test::block_on(
            pipeline.handle_message(TOPIC, uplink_json(&gps_payload(), 1.018).as_bytes()),
        );

        match outcome {
            PipelineOutcome::Published { topic, record } => {
                assert_eq!(topic, "application/3/device/70b3d57ed005a1b2/command/down");
                assert_eq!(record.coverage_level, CoverageLevel::Fair);
                assert_eq!(record.f_cnt, 42);
            }
            other => panic!("expected publish, got {:?}", other),
        }

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let frame = CoverageFrame::parse(&downlink_frame(&sent[0].1)).unwrap();
        assert!(frame.has_fix());
        assert!((frame.distance.meters().unwrap() - 2000.0).abs() < 5.0);
        assert_eq!(frame.coverage_level, CoverageLevel::Fair);
    }

    #[test]
    fn test_tts_uplink_answered_on_tenant_topic() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = Pipeline::new(
            config_for(ParserVariant::TheThingsStackV3, "ft-01", FrameFormat::Coverage, false),
            publisher.clone(),
        );

        let outcome = tokio_test::block_on(pipeline.handle_message(
            "v3/field-test@ttn/devices/ft-01/up",
            tts_uplink_json(&gps_payload()).as_bytes(),
        ));
        match outcome {
            PipelineOutcome::Published { topic, record } => {
                assert_eq!(topic, "v3/field-test@ttn/devices/ft-01/down/replace");
                assert_eq!(record.device_id, DEV_EUI);
                assert_eq!(record.coverage_level, CoverageLevel::Fair);
            }
            other => panic!("expected publish, got {:?}", other),
        }

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent[0].0, "v3/field-test@ttn/devices/ft-01/down/replace");
        let body: Value = serde_json::from_slice(&sent[0].1).unwrap();
        let downlink = &body["downlinks"][0];
        assert_eq!(downlink["f_port"], 2);

        let frame = CoverageFrame::parse(&base64_frame(&downlink["frm_payload"])).unwrap();
        assert!(frame.has_fix());
        assert!((frame.distance.meters().unwrap() - 2000.0).abs() < 5.0);
        assert_eq!(frame.coverage_level, CoverageLevel::Fair);
    }

    #[test]
    fn test_field_tester_format_downlink() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = Pipeline::new(
            config_for(ParserVariant::ChirpStackV3Plus, DEV_EUI, FrameFormat::FieldTester, false),
            publisher.clone(),
        );

        let outcome = tokio_test::block_on(
            pipeline.handle_message(TOPIC, uplink_json(&gps_payload(), 1.018).as_bytes()),
        );
        assert!(matches!(outcome, PipelineOutcome::Published { .. }));

        let sent = publisher.sent.lock().unwrap();
        let body: Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(body["fPort"], 2);
        // seq 42, rssi -97 -> 103, 2001 m -> 8 units of 250 m, 1 gateway
        assert_eq!(downlink_frame(&sent[0].1), vec![42, 103, 103, 8, 8, 1]);
    }

    #[test]
    fn test_missing_fix_publishes_sentinel() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = Pipeline::new(config(false), publisher.clone());

        let outcome = tokio_test::block_on(
            pipeline.handle_message(TOPIC, uplink_json(&no_fix_payload(), 1.018).as_bytes()),
        );
        match outcome {
            PipelineOutcome::Published { record, .. } => {
                assert_eq!(record.best_distance_m, Distance::Unknown);
            }
            other => panic!("expected publish, got {:?}", other),
        }

        let sent = publisher.sent.lock().unwrap();
        let frame = downlink_frame(&sent[0].1);
        assert_eq!(frame[0] & status::NO_FIX, status::NO_FIX);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), UNKNOWN_DISTANCE);
    }

    #[test]
    fn test_malformed_message_does_not_stop_pipeline() {
        let publisher = Arc::new(RecordingPublisher::default());
        let pipeline = Pipeline::new(config(false), publisher.clone());

        let outcome = tokio_test::block_on(pipeline.handle_message(TOPIC, b"{\"deviceInfo\":"));
        assert!(matches!(
            outcome,
            PipelineOutcome::Failed {
                stage: Stage::Parsing,
                error: PipelineError::Parse(_)
            }
        ));
        assert!(publisher.sent.lock().unwrap().is_empty());

        let outcome = tokio_test::block_on(
            pipeline.handle_message(TOPIC, uplink_json(&gps_payload(), 1.018).as_bytes()),
        );
        assert!(matches!(outcome, PipelineOutcome::Published { .. }));
        assert_eq!(publisher.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_other_device_is_not_answered() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tx, mut rx) = mpsc::channel(4);
        let pipeline = Pipeline::new(config(true), publisher.clone()).with_beehive(tx);

        let json = uplink_json(&gps_payload(), 1.018).replace(DEV_EUI, "0000000000000001");
        let outcome = tokio_test::block_on(pipeline.handle_message(TOPIC, json.as_bytes()));

        assert!(matches!(
            outcome,
            PipelineOutcome::Ignored(IgnoreReason::DeviceMismatch { .. })
        ));
        assert!(publisher.sent.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_failure_is_reported() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(4);
        let pipeline = Pipeline::new(config(true), publisher).with_beehive(tx);

        let outcome = tokio_test::block_on(
            pipeline.handle_message(TOPIC, uplink_json(&gps_payload(), 1.018).as_bytes()),
        );
        assert!(matches!(
            outcome,
            PipelineOutcome::Failed {
                stage: Stage::Publishing,
                error: PipelineError::Publish(_)
            }
        ));

        // Measurements are forwarded once coverage is computed
        let batch = rx.try_recv().unwrap();
        assert!(batch
            .measurements
            .iter()
            .any(|m| m.name == "gateway.num_gateways" && m.value == 1.0));
    }

    #[test]
    fn test_beehive_disabled_without_publish_flag() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (tx, mut rx) = mpsc::channel(4);
        let pipeline = Pipeline::new(config(false), publisher).with_beehive(tx);

        let outcome = tokio_test::block_on(
            pipeline.handle_message(TOPIC, uplink_json(&gps_payload(), 1.018).as_bytes()),
        );
        assert!(matches!(outcome, PipelineOutcome::Published { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Publishing.to_string(), "publishing");
        assert_eq!(Stage::Idle.to_string(), "idle");
    }
}
