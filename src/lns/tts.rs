//! The Things Stack v3 MQTT integration
//!
//! Reference: <https://www.thethingsindustries.com/docs/integrations/mqtt/>

use serde::Deserialize;
use serde_json::json;

use super::{
    base64_decode, parse_time, swap_topic_suffix, topic_level, LnsCodec, LocationJson, ParseError,
    RawUplink,
};
use crate::fieldtest::{DownlinkRecord, GatewayReception, LnsRevision};

/// Message published on `v3/<app>/devices/<device-id>/up`
#[derive(Debug, Deserialize)]
struct UplinkEnvelope {
    end_device_ids: Option<EndDeviceIds>,
    received_at: Option<String>,
    uplink_message: Option<UplinkMessage>,
}

#[derive(Debug, Deserialize)]
struct EndDeviceIds {
    device_id: Option<String>,
    dev_eui: Option<String>,
    application_ids: Option<ApplicationIds>,
}

#[derive(Debug, Deserialize)]
struct ApplicationIds {
    application_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UplinkMessage {
    f_port: Option<u8>,
    f_cnt: Option<u32>,
    /// Base64 FRMPayload
    frm_payload: Option<String>,
    /// Output of the application payload formatter
    decoded_payload: Option<serde_json::Value>,
    rx_metadata: Option<Vec<RxMetadata>>,
    received_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RxMetadata {
    gateway_ids: Option<GatewayIds>,
    rssi: Option<f64>,
    channel_rssi: Option<f64>,
    snr: Option<f64>,
    location: Option<LocationJson>,
}

#[derive(Debug, Deserialize)]
struct GatewayIds {
    gateway_id: Option<String>,
    eui: Option<String>,
}

pub struct TheThingsStack;

impl LnsCodec for TheThingsStack {
    fn subscribe_topic(&self, device_eui: &str) -> String {
        format!("v3/+/devices/{}/up", device_eui)
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<RawUplink>, ParseError> {
        let envelope: UplinkEnvelope = serde_json::from_slice(payload)?;

        // Join accepts, downlink acks etc. share the topic tree
        let message = match envelope.uplink_message {
            Some(message) => message,
            None => return Ok(None),
        };

        let ids = envelope
            .end_device_ids
            .ok_or(ParseError::MissingField("end_device_ids"))?;

        let device_id = ids
            .device_id
            .filter(|id| !id.is_empty())
            .or_else(|| topic_level(topic, 3));
        let dev_eui = ids.dev_eui.filter(|eui| !eui.is_empty());

        let (dev_eui, lns_device_id) = match (dev_eui, device_id) {
            (Some(eui), Some(id)) => (eui, id),
            (Some(eui), None) => (eui.clone(), eui),
            (None, Some(id)) => (id.clone(), id),
            (None, None) => return Err(ParseError::MissingField("end_device_ids.dev_eui")),
        };

        let application_id = ids
            .application_ids
            .and_then(|app| app.application_id)
            .filter(|id| !id.is_empty())
            .or_else(|| topic_level(topic, 1));

        let payload = match message.frm_payload.as_deref() {
            Some(data) => base64_decode(data)?,
            None => Vec::new(),
        };

        let received_at = parse_time(envelope.received_at.as_deref())
            .or_else(|| parse_time(message.received_at.as_deref()));

        let gateways = message
            .rx_metadata
            .unwrap_or_default()
            .into_iter()
            .map(|rx| {
                let gateway_id = rx
                    .gateway_ids
                    .and_then(|ids| ids.gateway_id.or(ids.eui))
                    .unwrap_or_default();
                GatewayReception {
                    gateway_id,
                    location: rx.location.as_ref().and_then(LocationJson::to_location),
                    rssi: rx.rssi.or(rx.channel_rssi),
                    snr: rx.snr,
                }
            })
            .collect();

        Ok(Some(RawUplink {
            dev_eui,
            lns_device_id,
            application_id,
            revision: LnsRevision::TheThingsStackV3,
            received_at,
            f_port: message.f_port,
            f_cnt: message.f_cnt,
            payload,
            decoded: message.decoded_payload,
            gateways,
        }))
    }

    fn reply_topic(&self, uplink_topic: &str) -> Option<String> {
        swap_topic_suffix(uplink_topic, "/up", "/down/replace")
    }

    fn downlink_topic(&self, application_id: &str, lns_device_id: &str) -> String {
        format!("v3/{}/devices/{}/down/replace", application_id, lns_device_id)
    }

    fn downlink_body(
        &self,
        _record: &DownlinkRecord,
        f_port: u8,
        frm_payload: &str,
    ) -> serde_json::Value {
        json!({
            "downlinks": [{
                "f_port": f_port,
                "frm_payload": frm_payload,
                "priority": "HIGH",
            }]
        })
    }
}
