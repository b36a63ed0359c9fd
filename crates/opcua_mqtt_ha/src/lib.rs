pub mod address;
pub mod address_space;
pub mod bridge;
pub mod catalogue;
pub mod config;
pub mod discovery;
pub mod entity;
pub mod mqtt;
pub mod topic;

pub use address_space::AddressSpace;
pub use address_space::OpcUaClient;
pub use bridge::Bridge;
pub use bridge::BridgeError;
pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use entity::Entity;
pub use entity::EntityType;
pub use mqtt::MqttClient;
pub use mqtt::RumqttcClient;
pub use topic::TopicBuilder;
