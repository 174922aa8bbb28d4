//! Field Tester uplink simulator
//!
//! Publishes field-tester uplinks to the broker the relay listens on and
//! prints the downlinks it answers with. Useful for testing without a
//! device or network server.
//!
//! Usage: cargo run --bin uplink-sim -- --device-devui 70b3d57ed005a1b2

use base64::Engine;
use bytes::{BufMut, BytesMut};
use clap::{Parser, ValueEnum};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration, Instant};

#[derive(Clone, Copy, ValueEnum)]
enum Lns {
    /// ChirpStack v4 event payloads
    Chirpstack,
    /// The Things Stack v3 uplink messages
    Tts,
}

#[derive(Parser)]
#[command(name = "uplink-sim")]
#[command(about = "Publishes simulated Field Tester uplinks and prints the downlinks")]
struct Args {
    #[arg(long = "device-devui", default_value = "70b3d57ed005a1b2")]
    device_devui: String,

    #[arg(long, value_enum, default_value_t = Lns::Chirpstack)]
    lns: Lns,

    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 1883)]
    port: u16,

    #[arg(long, default_value = "field-test")]
    application: String,
}

/// Gateway location shared by all scenarios
const GATEWAY: (f64, f64) = (48.8566, 2.3522);

struct Scenario {
    description: &'static str,
    /// Device position, `None` for a block without fix
    position: Option<(f64, f64)>,
    rssi: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let device = args.device_devui.to_lowercase();

    let (up_topic, down_topic) = match args.lns {
        Lns::Chirpstack => (
            format!("application/{}/device/{}/event/up", args.application, device),
            format!("application/{}/device/{}/command/down", args.application, device),
        ),
        Lns::Tts => (
            format!("v3/{}/devices/{}/up", args.application, device),
            format!("v3/{}/devices/{}/down/replace", args.application, device),
        ),
    };

    println!("📡 Field Tester Uplink Simulator");
    println!("  Broker: {}:{}", args.host, args.port);
    println!("  Uplinks:   {}", up_topic);
    println!("  Downlinks: {}", down_topic);
    println!();

    let mut options = MqttOptions::new(
        format!("uplink-sim-{}", uuid::Uuid::new_v4()),
        args.host.clone(),
        args.port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 16);
    client.subscribe(&down_topic, QoS::AtMostOnce).await?;

    let scenarios = [
        Scenario {
            description: "Next to the gateway (expect GOOD)",
            position: Some((48.8600, 2.3522)),
            rssi: -71.0,
        },
        Scenario {
            description: "About 3 km out (expect FAIR)",
            position: Some((48.8836, 2.3522)),
            rssi: -104.0,
        },
        Scenario {
            description: "Across the city (expect POOR)",
            position: Some((48.9200, 2.3522)),
            rssi: -117.0,
        },
        Scenario {
            description: "No GPS fix (expect NO_FIX)",
            position: None,
            rssi: -98.0,
        },
    ];

    for (f_cnt, scenario) in scenarios.iter().enumerate() {
        let payload = gps_block(scenario.position);
        let body = match args.lns {
            Lns::Chirpstack => chirpstack_uplink(&args.application, &device, f_cnt as u32, &payload, scenario.rssi),
            Lns::Tts => tts_uplink(&args.application, &device, f_cnt as u32, &payload, scenario.rssi),
        };

        println!("📤 {}", scenario.description);
        println!("   FRMPayload: {}", hex::encode(&payload));
        client
            .publish(&up_topic, QoS::AtMostOnce, false, serde_json::to_vec(&body)?)
            .await?;

        match wait_for_downlink(&mut eventloop, &down_topic, Duration::from_secs(5)).await {
            Some(frame) => print_frame(&frame),
            None => println!("   ⏰ No downlink (timeout)"),
        }
        println!();

        sleep(Duration::from_secs(1)).await;
    }

    client.disconnect().await?;
    println!("✨ Simulation complete!");
    Ok(())
}

/// Poll until a downlink arrives on `topic` and return its device frame
async fn wait_for_downlink(
    eventloop: &mut rumqttc::EventLoop,
    topic: &str,
    wait: Duration,
) -> Option<Vec<u8>> {
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match timeout(remaining, eventloop.poll()).await {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) if publish.topic == topic => {
                let body: Value = serde_json::from_slice(&publish.payload).ok()?;
                let data = body["data"]
                    .as_str()
                    .or_else(|| body["downlinks"][0]["frm_payload"].as_str())?;
                return base64::engine::general_purpose::STANDARD.decode(data).ok();
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                println!("   ❌ MQTT error: {}", e);
                return None;
            }
            Err(_) => return None,
        }
    }
}

fn print_frame(frame: &[u8]) {
    println!("   📥 Downlink: {} ({} bytes)", hex::encode(frame), frame.len());
    if frame.len() != 3 {
        return;
    }
    let status = frame[0];
    let distance = u16::from_be_bytes([frame[1], frame[2]]);
    let level = match (status >> 4) & 0x03 {
        1 => "POOR",
        2 => "FAIR",
        3 => "GOOD",
        _ => "UNKNOWN",
    };
    let distance = if distance == 0xFFFF {
        "unknown".to_string()
    } else {
        format!("{} m", distance)
    };
    println!(
        "   fix={} saturated={} coverage={} distance={}",
        status & 0x01 != 0,
        status & 0x04 != 0,
        level,
        distance
    );
}

/// Field-tester GPS block (10 bytes)
fn gps_block(position: Option<(f64, f64)>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(10);
    match position {
        Some((lat, lon)) => {
            let enc_lat = ((lat.abs() * 10_000_000.0 - 53.0) / 108.0).round() as u32;
            let enc_lon = ((lon.abs() * 10_000_000.0 - 107.0) / 215.0).round() as u32;
            let mut b0 = ((enc_lat >> 17) & 0x3f) as u8;
            if lon < 0.0 {
                b0 |= 0x80;
            }
            if lat < 0.0 {
                b0 |= 0x40;
            }
            buf.put_u8(b0);
            buf.put_u8((enc_lat >> 9) as u8);
            buf.put_u8((enc_lat >> 1) as u8);
            buf.put_u8((((enc_lat & 0x01) << 7) | ((enc_lon >> 16) & 0x7f)) as u8);
            buf.put_u8((enc_lon >> 8) as u8);
            buf.put_u8(enc_lon as u8);
            buf.put_u16(1035); // 35 m
            buf.put_u8(9); // HDOP 0.9
            buf.put_u8(9); // satellites
        }
        None => {
            buf.put_bytes(0, 6);
            buf.put_u16(1000);
            buf.put_u8(99);
            buf.put_u8(0);
        }
    }
    buf.to_vec()
}

fn chirpstack_uplink(app: &str, device: &str, f_cnt: u32, payload: &[u8], rssi: f64) -> Value {
    json!({
        "deduplicationId": uuid::Uuid::new_v4().to_string(),
        "time": chrono::Utc::now().to_rfc3339(),
        "deviceInfo": {
            "applicationId": app,
            "deviceName": "field-tester",
            "devEui": device,
        },
        "fCnt": f_cnt,
        "fPort": 1,
        "data": base64::engine::general_purpose::STANDARD.encode(payload),
        "rxInfo": [{
            "gatewayId": "aabbccddeeff0011",
            "rssi": rssi,
            "snr": 7.5,
            "location": { "latitude": GATEWAY.0, "longitude": GATEWAY.1 },
        }],
    })
}

fn tts_uplink(app: &str, device: &str, f_cnt: u32, payload: &[u8], rssi: f64) -> Value {
    json!({
        "end_device_ids": {
            "device_id": device,
            "application_ids": { "application_id": app },
            "dev_eui": device.to_uppercase(),
        },
        "received_at": chrono::Utc::now().to_rfc3339(),
        "uplink_message": {
            "f_port": 1,
            "f_cnt": f_cnt,
            "frm_payload": base64::engine::general_purpose::STANDARD.encode(payload),
            "rx_metadata": [{
                "gateway_ids": { "gateway_id": "sim-gateway", "eui": "AABBCCDDEEFF0011" },
                "rssi": rssi,
                "snr": 7.5,
                "location": { "latitude": GATEWAY.0, "longitude": GATEWAY.1 },
            }],
        },
    })
}
