use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::ConnectReturnCode;
use rumqttc::Event;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing;
use uuid::Uuid;

use super::MqttError;
use crate::config::MqttConfig;
use crate::discovery::PAYLOAD_NOT_AVAILABLE;

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send + Sync {
    /// Connect to the MQTT broker and wait for it to accept the session
    async fn connect(&self) -> Result<(), MqttError>;

    async fn disconnect(&self) -> Result<(), MqttError>;

    /// Subscribe to an MQTT topic
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Publish a message to an MQTT topic
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), MqttError>;

    /// Wait for the next message from subscribed topics
    ///
    /// Returns None once the client has stopped
    async fn poll_message(&self) -> Option<MqttMessage>;
}

/// Mock MQTT client for testing
#[cfg(test)]
pub struct MockMqttClient {
    pub subscriptions: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>, bool)>>,
    pub is_connected: std::sync::atomic::AtomicBool,
    pub refuse_connect: bool,
    incoming_tx: mpsc::UnboundedSender<MqttMessage>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MqttMessage>>,
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&self) -> Result<(), MqttError> {
        if self.refuse_connect {
            return Err(MqttError::Refused("NotAuthorized".to_string()));
        }
        self.is_connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.is_connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), MqttError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    async fn poll_message(&self) -> Option<MqttMessage> {
        self.incoming_rx.lock().await.recv().await
    }
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            is_connected: std::sync::atomic::AtomicBool::new(false),
            refuse_connect: false,
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        }
    }

    /// Queue a message as if the broker had delivered it
    pub fn add_message(&self, topic: &str, payload: &[u8]) {
        let _ = self.incoming_tx.send(MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn published_to(&self, topic: &str) -> Vec<(Vec<u8>, bool)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, payload, retain)| (payload.clone(), *retain))
            .collect()
    }
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    reconnect_delay: Duration,

    /// AsyncClient (created in connect())
    client: Mutex<Option<AsyncClient>>,

    /// Topics to restore whenever the broker hands out a fresh session
    subscriptions: Arc<Mutex<Vec<String>>>,

    /// Message receiver (created in connect())
    message_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<MqttMessage>>>,

    /// Background event loop task handle
    event_loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration.
    ///
    /// The broker publishes `offline` to `availability_topic` on our behalf if
    /// the connection drops without a clean disconnect.
    pub fn new(config: &MqttConfig, availability_topic: &str) -> Self {
        let client_id = format!("{}-{}", config.client_id_prefix, Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, config.broker.clone(), config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        // Allow large MQTT packets (2 MiB) for discovery payloads
        mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

        // Set credentials if provided
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        mqtt_options.set_last_will(LastWill::new(
            availability_topic,
            PAYLOAD_NOT_AVAILABLE,
            QoS::AtLeastOnce,
            true,
        ));

        Self {
            mqtt_options,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            client: Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            message_rx: tokio::sync::Mutex::new(None),
            event_loop_task: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<AsyncClient, MqttError> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(MqttError::NotConnected)
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&self) -> Result<(), MqttError> {
        // Create client and event loop
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);

        // Drive the handshake here so a bad broker address or rejected
        // credentials fail startup instead of retrying in the background
        loop {
            match event_loop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(MqttError::Refused(format!("{:?}", ack.code)));
                    }
                    break;
                }
                _ => continue,
            }
        }

        // Create channel for messages
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::clone(&self.subscriptions);
        let resubscribe_client = client.clone();
        let reconnect_delay = self.reconnect_delay;

        // Spawn background task to poll event loop
        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                        };

                        // Send to channel; if receiver dropped, exit
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        let topics = subscriptions
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        tracing::info!(
                            "Reconnected to MQTT broker, restoring {} subscriptions",
                            topics.len()
                        );
                        // Requests queue behind this loop, so they must not be
                        // awaited from inside it
                        let client = resubscribe_client.clone();
                        tokio::spawn(async move {
                            for topic in topics {
                                if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                                    tracing::warn!("Failed to resubscribe to {}: {}", topic, e);
                                }
                            }
                        });
                    }
                    Ok(_) => {
                        // Ignore other events (puback, pingresp, etc.)
                    }
                    Err(e) => {
                        tracing::warn!("MQTT event loop error: {}", e);
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
            tracing::info!("MQTT event loop task exiting");
        });

        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        *self.message_rx.lock().await = Some(message_rx);
        if let Some(old) = self
            .event_loop_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let client = self.client()?;
        client.disconnect().await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        let client = self.client()?;

        client.subscribe(topic, QoS::AtLeastOnce).await?;

        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if !subscriptions.iter().any(|t| t == topic) {
            subscriptions.push(topic.to_string());
        }

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<(), MqttError> {
        let client = self.client()?;

        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;

        Ok(())
    }

    async fn poll_message(&self) -> Option<MqttMessage> {
        match self.message_rx.lock().await.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_loop_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
