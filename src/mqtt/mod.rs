//! MQTT transport
//!
//! One client connection carries both directions: the event loop delivers
//! uplinks to the pipeline and [`MqttPublisher`] queues downlinks on the
//! same client. rumqttc reconnects on the next poll after an error, so the
//! loop only has to pace retries and resubscribe on every ConnAck.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MqttEndpoint;
use crate::pipeline::{DownlinkPublisher, Pipeline, PublishError};

/// Delivery for both subscriptions and downlinks
const QOS: QoS = QoS::AtMostOnce;

pub fn client_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn mqtt_options(endpoint: &MqttEndpoint) -> MqttOptions {
    let settings = &endpoint.settings;
    let mut options = MqttOptions::new(
        client_id(&settings.client_id_prefix),
        endpoint.host.clone(),
        endpoint.port,
    );
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
    options.set_clean_session(true);
    if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

pub fn connect(endpoint: &MqttEndpoint) -> (AsyncClient, EventLoop) {
    let options = mqtt_options(endpoint);
    info!(
        "Connecting to MQTT broker {}:{} as {}",
        endpoint.host,
        endpoint.port,
        options.client_id()
    );
    AsyncClient::new(options, endpoint.settings.channel_capacity.max(1))
}

/// Queues downlinks on the shared client
///
/// `try_publish` never waits on the request channel, which the event loop
/// drains; awaiting here from inside the loop would deadlock once it fills.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DownlinkPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client.try_publish(topic, QOS, false, payload)?;
        Ok(())
    }
}

/// Drive the connection and feed every uplink through the pipeline
///
/// Returns once the broker stays unreachable for more than
/// `max_reconnect_attempts` consecutive polls (0 retries forever).
pub async fn run_event_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    endpoint: &MqttEndpoint,
    pipeline: &Pipeline,
) -> anyhow::Result<()> {
    let settings = &endpoint.settings;
    let topic = pipeline.config().subscribe_topic.clone();
    let retry_delay = Duration::from_secs(settings.reconnect_delay_secs);
    let mut failures = 0u32;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker {}:{}", endpoint.host, endpoint.port);
                failures = 0;
                match client.try_subscribe(topic.as_str(), QOS) {
                    Ok(()) => info!("Subscribing to {}", topic),
                    Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // Every stage logs its own failure
                pipeline
                    .handle_message(&publish.topic, &publish.payload)
                    .await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent disconnect");
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                if settings.max_reconnect_attempts > 0 && failures > settings.max_reconnect_attempts
                {
                    anyhow::bail!(
                        "MQTT broker {}:{} unreachable after {} attempts: {}",
                        endpoint.host,
                        endpoint.port,
                        settings.max_reconnect_attempts,
                        e
                    );
                }
                warn!(
                    "MQTT connection error ({}/{}): {}. Reconnecting in {:?}...",
                    failures, settings.max_reconnect_attempts, e, retry_delay
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
