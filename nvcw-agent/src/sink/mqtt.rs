use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{BatchPayload, MetricsSink, SinkResponse};
use crate::config::MqttConfig;
use crate::error::{SinkError, SinkErrorKind};
use crate::mapper::MetricPoint;

/// Publishes each batch as one JSON message on `{prefix}/{namespace}/metrics@v1`
///
/// A batch is acked once it is queued on a connected client. While the broker
/// is unreachable, `put` fails with a retryable transport error instead.
pub struct MqttSink {
    client: AsyncClient,
    topic_prefix: String,
    event_loop: JoinHandle<()>,
    connected: watch::Receiver<bool>,
    disconnected: Arc<Notify>,
    connect_wait: Duration,
}

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_WAIT: Duration = Duration::from_secs(2);
const REQUEST_QUEUE: usize = 10;

impl MqttSink {
    pub fn connect(config: &MqttConfig, host: &str, max_payload_bytes: usize) -> Self {
        let client_id = config.client_id.clone().unwrap_or_else(|| client_id_for(host));

        let mut options = MqttOptions::new(&client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        options.set_clean_session(true);
        options.set_max_packet_size(max_payload_bytes, max_payload_bytes);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE);
        let (link, connected) = watch::channel(false);
        let disconnected = Arc::new(Notify::new());
        let notify = Arc::clone(&disconnected);

        // Drives the connection; rumqttc reconnects on the next poll
        let event_loop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT sink connected");
                        link.send_replace(true);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT sink disconnected");
                        link.send_replace(false);
                        notify.notify_one();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        link.send_replace(false);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        info!(
            client_id = %client_id,
            broker = %config.broker_host,
            port = config.broker_port,
            "MQTT sink initialized"
        );

        Self {
            client,
            topic_prefix: config.topic_prefix.trim_end_matches('/').to_string(),
            event_loop,
            connected,
            disconnected,
            connect_wait: CONNECT_WAIT,
        }
    }

    /// How long `put` waits for a pending connection before failing
    pub fn with_connect_wait(mut self, wait: Duration) -> Self {
        self.connect_wait = wait;
        self
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn topic(&self, namespace: &str) -> String {
        format!("{}/{}/metrics@v1", self.topic_prefix, namespace)
    }

    async fn wait_connected(&self) -> Result<(), SinkError> {
        let mut connected = self.connected.clone();
        let result = match timeout(self.connect_wait, connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SinkError::new(SinkErrorKind::Transport, "MQTT event loop stopped")),
            Err(_) => Err(SinkError::new(SinkErrorKind::Transport, "MQTT broker not connected")),
        };
        result
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

#[async_trait]
impl MetricsSink for MqttSink {
    async fn put(&self, namespace: &str, points: &[MetricPoint]) -> Result<SinkResponse, SinkError> {
        let payload = serde_json::to_vec(&BatchPayload { namespace, metric_data: points })
            .map_err(|e| SinkError::new(SinkErrorKind::Malformed, e.to_string()))?;
        let topic = self.topic(namespace);

        self.wait_connected().await?;
        // Never blocks; a full queue means the broker is not keeping up
        self.client
            .try_publish(&topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| SinkError::new(SinkErrorKind::Transport, format!("MQTT queue: {}", e)))?;

        debug!(topic = %topic, points = points.len(), "Batch queued on MQTT");
        Ok(SinkResponse::Ack)
    }

    /// The disconnect is queued behind pending publishes, so waiting for it
    /// drains them. Without a connection there is nothing to drain.
    async fn close(&self) {
        if !self.is_connected() {
            warn!("MQTT broker not connected, dropping queued messages");
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {}", e);
            return;
        }
        if timeout(CLOSE_TIMEOUT, self.disconnected.notified()).await.is_err() {
            warn!("MQTT sink did not drain within {:?}", CLOSE_TIMEOUT);
        }
    }
}

/// MQTT client ids must be unique per broker
fn client_id_for(host: &str) -> String {
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("nvcw-{}-{}", host, &suffix[..8])
}
