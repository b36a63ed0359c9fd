//! Startup, steady state and shutdown of the bridge.

mod discover;
mod sync;

use std::future::Future;
use std::sync::Arc;

use tracing::error;
use tracing::info;
use tracing::warn;

pub use discover::EntityDiscovery;
pub use sync::StateMessage;
pub use sync::SwitchState;
pub use sync::SyncEngine;
pub use sync::SyncError;
pub use sync::ToggleOutcome;

use crate::address_space::AddressSpace;
use crate::address_space::OpcUaError;
use crate::config::Config;
use crate::discovery::PAYLOAD_AVAILABLE;
use crate::discovery::PAYLOAD_NOT_AVAILABLE;
use crate::entity::Entity;
use crate::mqtt::MessageBus;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::topic::TopicBuilder;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("OPC UA: {0}")]
    OpcUa(#[from] OpcUaError),

    #[error("MQTT: {0}")]
    Mqtt(#[from] MqttError),
}

/// Owns both connections and every entity binding for one process.
pub struct Bridge<A: AddressSpace, C: MqttClient> {
    address_space: Arc<A>,
    bus: Arc<MessageBus<C>>,
    root_path: String,
    topics: TopicBuilder,
}

impl<A, C> Bridge<A, C>
where
    A: AddressSpace + 'static,
    C: MqttClient + 'static,
{
    pub fn new(address_space: A, client: C, config: &Config) -> Self {
        Self {
            address_space: Arc::new(address_space),
            bus: Arc::new(MessageBus::new(client)),
            root_path: config.opcua.root_path.clone(),
            topics: TopicBuilder::new(&config.mqtt.discovery_prefix, &config.bridge.id),
        }
    }

    /// Connect, discover and register every supported entity.
    ///
    /// Connection failures are fatal. Registration failures only cost the
    /// affected entity. Returns the entities that were registered.
    pub async fn start(&self) -> Result<Vec<Entity>, BridgeError> {
        self.address_space.connect().await?;
        info!("Connected to OPC UA server");

        self.bus.connect().await?;
        info!("Connected to MQTT broker");

        self.bus
            .publish_retained(&self.topics.availability_topic(), PAYLOAD_AVAILABLE.as_bytes())
            .await?;

        let entities = EntityDiscovery::new(Arc::clone(&self.address_space), &self.root_path)
            .discover()
            .await?;

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&self.address_space),
            Arc::clone(&self.bus),
            &self.root_path,
            self.topics.clone(),
        ));

        let outcomes = futures::future::join_all(
            entities
                .iter()
                .map(|entity| engine.register(entity.clone())),
        )
        .await;

        let mut registered = Vec::with_capacity(entities.len());
        for (entity, outcome) in entities.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => registered.push(entity),
                Err(e) => error!("Failed to register {}: {}", entity.system_name, e),
            }
        }

        info!("Bridge running with {} entities", registered.len());
        Ok(registered)
    }

    /// Mark the bridge offline and close both connections.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");

        if let Err(e) = self
            .bus
            .publish_retained(
                &self.topics.availability_topic(),
                PAYLOAD_NOT_AVAILABLE.as_bytes(),
            )
            .await
        {
            warn!("Failed to publish offline availability: {}", e);
        }
        if let Err(e) = self.bus.disconnect().await {
            warn!("Error disconnecting from MQTT broker: {}", e);
        }
        if let Err(e) = self.address_space.disconnect().await {
            warn!("Error disconnecting from OPC UA server: {}", e);
        }
    }

    /// Start, keep running until `shutdown` resolves, then shut down.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    #[cfg(test)]
    fn bus(&self) -> &MessageBus<C> {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::address::AddressBuilder;
    use crate::address_space::mock::MockAddressSpace;
    use crate::mqtt::MockMqttClient;

    const ROOT: &str = r#"ns=3;s="SmartHome_Data""#;

    fn plant() -> MockAddressSpace {
        let space = MockAddressSpace::new();
        space.set_children(ROOT, &["Lamp1", "Lamp2"]);
        for name in ["Lamp1", "Lamp2"] {
            let device = || AddressBuilder::new(ROOT).entity(name).device();
            space.set_value(&device().manufacturer(), json!("jonasclaes.be"));
            space.set_value(&device().model(), json!("LIGHT-UA"));
            space.set_value(&device().version(), json!("v2.0.0"));
            space.set_value(&device().device_type(), json!("LIGHT"));
            space.set_value(&device().capabilities().on_off(), json!(true));
            space.set_value(&device().capabilities().brightness(), json!(false));
            space.set_value(&device().name(), json!("Kitchen Lamp"));
        }
        space
    }

    #[tokio::test]
    async fn test_start_registers_discovered_entities() {
        let bridge = Bridge::new(plant(), MockMqttClient::new(), &Config::default());
        let topics = TopicBuilder::default();

        let entities = bridge.start().await.unwrap();

        assert_eq!(entities.len(), 2);
        assert!(bridge.address_space.is_connected());
        assert_eq!(
            bridge.bus().client().published_to(&topics.availability_topic()),
            vec![(b"online".to_vec(), true)]
        );
        for entity in &entities {
            assert_eq!(
                bridge.bus().client().published_to(&topics.config_topic(entity)).len(),
                1
            );
        }
    }

    #[tokio::test]
    async fn test_refused_broker_is_fatal() {
        let mut client = MockMqttClient::new();
        client.refuse_connect = true;
        let bridge = Bridge::new(plant(), client, &Config::default());

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::Mqtt(MqttError::Refused(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_until_marks_offline_on_shutdown() {
        let bridge = Bridge::new(plant(), MockMqttClient::new(), &Config::default());
        let topics = TopicBuilder::default();

        bridge.run_until(async {}).await.unwrap();

        assert_eq!(
            bridge.bus().client().published_to(&topics.availability_topic()),
            vec![(b"online".to_vec(), true), (b"offline".to_vec(), true)]
        );
        assert!(!bridge.address_space.is_connected());
        assert!(
            !bridge
                .bus()
                .client()
                .is_connected
                .load(std::sync::atomic::Ordering::SeqCst)
        );
    }
}
