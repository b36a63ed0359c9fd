use crate::entity::Entity;

/// Builds the MQTT topic names for entities of one bridge.
///
/// Topic format:
/// - config: `{discovery_prefix}/{platform}/{bridge_id}/{system_name}/config`
/// - state: `{bridge_id}/{platform}/{system_name}/state`
/// - command: `{bridge_id}/{platform}/{system_name}/command`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    discovery_prefix: String,
    bridge_id: String,
}

impl TopicBuilder {
    pub fn new(discovery_prefix: impl Into<String>, bridge_id: impl Into<String>) -> Self {
        Self {
            discovery_prefix: discovery_prefix.into(),
            bridge_id: bridge_id.into(),
        }
    }

    pub fn config_topic(&self, entity: &Entity) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix,
            entity.entity_type.platform(),
            self.bridge_id,
            entity.system_name
        )
    }

    pub fn state_topic(&self, entity: &Entity) -> String {
        format!(
            "{}/{}/{}/state",
            self.bridge_id,
            entity.entity_type.platform(),
            entity.system_name
        )
    }

    pub fn command_topic(&self, entity: &Entity) -> String {
        format!(
            "{}/{}/{}/command",
            self.bridge_id,
            entity.entity_type.platform(),
            entity.system_name
        )
    }

    /// Bridge-wide availability topic (`online`/`offline`)
    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.bridge_id)
    }
}

impl Default for TopicBuilder {
    fn default() -> Self {
        Self::new("homeassistant", "opcua-mqtt-homeassistant")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::CapabilitySet;
    use crate::entity::EntityType;

    fn lamp() -> Entity {
        Entity {
            system_name: "Lamp1".to_string(),
            manufacturer: "jonasclaes.be".to_string(),
            model: "LIGHT-UA".to_string(),
            version: "v2.0.0".to_string(),
            entity_type: EntityType::Light,
            capabilities: CapabilitySet::from_flags(Some(true), Some(true)),
            display_name: "KitchenLamp".to_string(),
        }
    }

    #[test]
    fn test_topic_names() {
        let topics = TopicBuilder::default();
        let entity = lamp();
        assert_eq!(
            topics.config_topic(&entity),
            "homeassistant/light/opcua-mqtt-homeassistant/Lamp1/config"
        );
        assert_eq!(
            topics.state_topic(&entity),
            "opcua-mqtt-homeassistant/light/Lamp1/state"
        );
        assert_eq!(
            topics.command_topic(&entity),
            "opcua-mqtt-homeassistant/light/Lamp1/command"
        );
        assert_eq!(
            topics.availability_topic(),
            "opcua-mqtt-homeassistant/availability"
        );
    }

    #[test]
    fn test_custom_prefix_and_bridge_id() {
        let topics = TopicBuilder::new("ha", "plant");
        let entity = lamp();
        assert_eq!(topics.config_topic(&entity), "ha/light/plant/Lamp1/config");
        assert_eq!(topics.command_topic(&entity), "plant/light/Lamp1/command");
        // Stable across calls
        assert_eq!(topics.state_topic(&entity), topics.state_topic(&entity));
    }
}
