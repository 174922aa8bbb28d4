//! ChirpStack v3 and v4 MQTT integration
//!
//! Reference: <https://www.chirpstack.io/docs/chirpstack/integrations/mqtt.html>
//!
//! v4 payloads carry a `deviceInfo` object; v3 payloads have `devEUI` and
//! `applicationID` at the top level and name the SNR field `loRaSNR`.

use serde::Deserialize;
use serde_json::json;

use super::{
    base64_decode, id_string, parse_time, swap_topic_suffix, topic_level, LnsCodec, LocationJson,
    ParseError, RawUplink,
};
use crate::fieldtest::{DownlinkRecord, GatewayReception, LnsRevision};

/// `event/up` payload
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UplinkEvent {
    /// v3
    #[serde(rename = "devEUI")]
    dev_eui: Option<String>,
    /// v3 (string or number depending on marshaler)
    #[serde(rename = "applicationID")]
    application_id: Option<serde_json::Value>,
    /// v4
    device_info: Option<DeviceInfo>,
    time: Option<String>,
    f_port: Option<u8>,
    f_cnt: Option<u32>,
    /// Base64 FRMPayload
    data: Option<String>,
    /// Output of the device-profile codec
    object: Option<serde_json::Value>,
    rx_info: Option<Vec<RxInfo>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo {
    dev_eui: Option<String>,
    application_id: Option<String>,
}

/// Per-gateway reception metadata
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RxInfo {
    #[serde(alias = "gatewayID")]
    gateway_id: Option<String>,
    rssi: Option<f64>,
    #[serde(alias = "loRaSNR")]
    snr: Option<f64>,
    location: Option<LocationJson>,
    time: Option<String>,
}

pub struct ChirpStack;

impl LnsCodec for ChirpStack {
    fn subscribe_topic(&self, device_eui: &str) -> String {
        format!("application/+/device/{}/event/up", device_eui)
    }

    fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<RawUplink>, ParseError> {
        let event: UplinkEvent = serde_json::from_slice(payload)?;

        let revision = if event.device_info.is_some() {
            LnsRevision::ChirpStackV4
        } else {
            LnsRevision::ChirpStackV3
        };

        let (dev_eui, application_id) = match &event.device_info {
            Some(info) => (info.dev_eui.clone(), info.application_id.clone()),
            None => (event.dev_eui.clone(), id_string(event.application_id.as_ref())),
        };
        let dev_eui = dev_eui
            .filter(|eui| !eui.is_empty())
            .ok_or(ParseError::MissingField("devEUI"))?;
        let application_id = application_id
            .filter(|id| !id.is_empty())
            .or_else(|| topic_level(topic, 1));

        let payload = match event.data.as_deref() {
            Some(data) => base64_decode(data)?,
            None => Vec::new(),
        };

        let rx_info = event.rx_info.unwrap_or_default();

        // v3 has no top-level time; fall back to the first gateway timestamp
        let received_at = parse_time(event.time.as_deref())
            .or_else(|| parse_time(rx_info.iter().find_map(|rx| rx.time.as_deref())));

        let gateways = rx_info
            .into_iter()
            .map(|rx| GatewayReception {
                gateway_id: rx.gateway_id.unwrap_or_default(),
                location: rx.location.as_ref().and_then(LocationJson::to_location),
                rssi: rx.rssi,
                snr: rx.snr,
            })
            .collect();

        Ok(Some(RawUplink {
            lns_device_id: dev_eui.clone(),
            dev_eui,
            application_id,
            revision,
            received_at,
            f_port: event.f_port,
            f_cnt: event.f_cnt,
            payload,
            decoded: event.object,
            gateways,
        }))
    }

    fn reply_topic(&self, uplink_topic: &str) -> Option<String> {
        swap_topic_suffix(uplink_topic, "/event/up", "/command/down")
    }

    fn downlink_topic(&self, application_id: &str, lns_device_id: &str) -> String {
        format!(
            "application/{}/device/{}/command/down",
            application_id, lns_device_id
        )
    }

    fn downlink_body(
        &self,
        record: &DownlinkRecord,
        f_port: u8,
        frm_payload: &str,
    ) -> serde_json::Value {
        let mut body = json!({
            "confirmed": false,
            "fPort": f_port,
            "data": frm_payload,
        });
        if record.lns_revision == LnsRevision::ChirpStackV4 {
            body["devEui"] = json!(record.lns_device_id);
        }
        body
    }
}
