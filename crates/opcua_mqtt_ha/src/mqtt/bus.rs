use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;

use super::MqttClient;
use super::MqttError;
use super::MqttMessage;

/// Callback fired with (topic, payload) for every message on its topic
pub type MessageHandler = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

type HandlerMap = Arc<RwLock<HashMap<String, Vec<MessageHandler>>>>;

/// Shared MQTT connection with exact-topic handler dispatch.
///
/// Every handler registered for a topic runs for each message on it, in its
/// own task, so a slow handler does not hold up the others.
pub struct MessageBus<C: MqttClient> {
    client: Arc<C>,
    handlers: HandlerMap,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MqttClient + 'static> MessageBus<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            dispatch_task: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Connect and start dispatching incoming messages
    pub async fn connect(&self) -> Result<(), MqttError> {
        self.client.connect().await?;

        let client = Arc::clone(&self.client);
        let handlers = Arc::clone(&self.handlers);
        let task = tokio::spawn(async move {
            while let Some(msg) = client.poll_message().await {
                Self::dispatch(&handlers, msg);
            }
            info!("MQTT dispatch task exiting");
        });

        if let Some(old) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Some(task) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.client.disconnect().await
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), MqttError> {
        trace!("Publishing {} bytes to {}", payload.len(), topic);
        self.client.publish(topic, payload, false).await
    }

    pub async fn publish_retained(&self, topic: &str, payload: &[u8]) -> Result<(), MqttError> {
        trace!("Publishing {} retained bytes to {}", payload.len(), topic);
        self.client.publish(topic, payload, true).await
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        debug!("Subscribing to {}", topic);
        self.client.subscribe(topic).await
    }

    /// Add a handler for `topic`. Handlers are never replaced, only appended.
    pub fn register_handler(&self, topic: &str, handler: MessageHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic.to_string())
            .or_default()
            .push(handler);
    }

    fn dispatch(handlers: &HandlerMap, msg: MqttMessage) -> usize {
        let matching = handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&msg.topic)
            .cloned()
            .unwrap_or_default();

        debug!(
            "Received message on topic {}, firing {} handlers",
            msg.topic,
            matching.len()
        );

        for handler in &matching {
            tokio::spawn(handler(msg.topic.clone(), msg.payload.clone()));
        }
        matching.len()
    }
}
