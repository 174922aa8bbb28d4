//! Downlink encoder
//!
//! Wraps the device frame of a [`DownlinkRecord`] into the JSON downlink
//! request of the configured LNS and picks the topic to publish it on:
//! the uplink topic with its event levels swapped, or the LNS template when
//! the uplink topic is not concrete. The device answers on the port after
//! the one it reported on.

use base64::Engine;
use thiserror::Error;

use super::ParserVariant;
use crate::fieldtest::DownlinkRecord;

/// Largest FRMPayload accepted at any LoRaWAN data rate
pub const MAX_FRM_PAYLOAD: usize = 242;

/// Application ports usable for downlinks
const APPLICATION_PORTS: std::ops::RangeInclusive<u8> = 1..=223;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("downlink record has no device ID")]
    EmptyDeviceId,

    #[error("downlink frame is empty")]
    EmptyPayload,

    #[error("downlink frame of {0} bytes exceeds the 242 byte limit")]
    PayloadTooLarge(usize),

    #[error("no valid reply port for uplink port {0}")]
    InvalidPort(u8),

    #[error("uplink topic has wildcards and application ID is unknown, cannot build downlink topic")]
    MissingApplicationId,

    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Topic and MQTT payload of one downlink request
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedDownlink {
    pub topic: String,
    pub payload: Vec<u8>,
    pub f_port: u8,
}

pub struct DownlinkEncoder;

impl DownlinkEncoder {
    pub fn encode(
        record: &DownlinkRecord,
        variant: ParserVariant,
    ) -> Result<EncodedDownlink, EncodeError> {
        if record.device_id.is_empty() || record.lns_device_id.is_empty() {
            return Err(EncodeError::EmptyDeviceId);
        }
        if record.encoded_payload.is_empty() {
            return Err(EncodeError::EmptyPayload);
        }
        if record.encoded_payload.len() > MAX_FRM_PAYLOAD {
            return Err(EncodeError::PayloadTooLarge(record.encoded_payload.len()));
        }

        let f_port = record
            .f_port
            .checked_add(1)
            .filter(|port| APPLICATION_PORTS.contains(port))
            .ok_or(EncodeError::InvalidPort(record.f_port))?;

        let codec = variant.codec();
        let topic = match codec.reply_topic(&record.uplink_topic) {
            Some(topic) => topic,
            None => {
                let application_id = record
                    .application_id
                    .as_deref()
                    .ok_or(EncodeError::MissingApplicationId)?;
                codec.downlink_topic(application_id, &record.lns_device_id)
            }
        };

        let frm_payload = base64::engine::general_purpose::STANDARD.encode(&record.encoded_payload);
        let body = codec.downlink_body(record, f_port, &frm_payload);

        Ok(EncodedDownlink {
            topic,
            payload: serde_json::to_vec(&body)?,
            f_port,
        })
    }
}
