mod bus;
mod client;

pub use bus::MessageBus;
pub use bus::MessageHandler;
#[cfg(test)]
pub(crate) use client::MockMqttClient;
pub use client::MqttClient;
pub use client::MqttMessage;
pub use client::RumqttcClient;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT client not connected. Call connect() first.")]
    NotConnected,

    #[error("Failed to connect to MQTT broker: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("MQTT broker refused the connection: {0}")]
    Refused(String),

    #[error("MQTT request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}
