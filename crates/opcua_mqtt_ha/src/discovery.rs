//! Home Assistant MQTT discovery documents.
//!
//! Reference: https://www.home-assistant.io/integrations/mqtt/#mqtt-discovery

use serde::Serialize;

use crate::entity::Capability;
use crate::entity::Entity;
use crate::entity::EntityType;
use crate::topic::TopicBuilder;

pub const ORIGIN_NAME: &str = "opcua-mqtt-homeassistant";
pub const ORIGIN_URL: &str = "https://github.com/jonasclaes/opcua-mqtt-homeassistant";

pub const PAYLOAD_AVAILABLE: &str = "online";
pub const PAYLOAD_NOT_AVAILABLE: &str = "offline";

/// Device block shared by every platform
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

/// Identifies the software that published the discovery document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginInfo {
    pub name: &'static str,
    pub sw_version: &'static str,
    pub url: &'static str,
}

impl Default for OriginInfo {
    fn default() -> Self {
        Self {
            name: ORIGIN_NAME,
            sw_version: env!("CARGO_PKG_VERSION"),
            url: ORIGIN_URL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryBase {
    pub device: DeviceInfo,
    pub origin: OriginInfo,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    pub qos: u8,
}

/// `light` platform with the JSON schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightDiscovery {
    #[serde(flatten)]
    pub base: DiscoveryBase,
    pub platform: &'static str,
    pub command_topic: String,
    pub state_topic: String,
    pub schema: &'static str,
    pub name: &'static str,
    pub unique_id: String,
    pub supported_color_modes: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_scale: Option<u32>,
    pub optimistic: bool,
}

/// Discovery document for one entity, published once at registration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DiscoveryPayload {
    Light(LightDiscovery),
}

impl DiscoveryPayload {
    /// Build the document for `entity`.
    ///
    /// Brightness support switches the color mode from `onoff` to
    /// `brightness`; Home Assistant treats the modes as mutually exclusive.
    pub fn from_entity(entity: &Entity, topics: &TopicBuilder) -> Self {
        let base = DiscoveryBase {
            device: DeviceInfo {
                identifiers: vec![entity.system_name.clone()],
                name: humanize(&entity.display_name),
                manufacturer: entity.manufacturer.clone(),
                model: entity.model.clone(),
                sw_version: entity.version.clone(),
            },
            origin: OriginInfo::default(),
            availability_topic: topics.availability_topic(),
            payload_available: PAYLOAD_AVAILABLE,
            payload_not_available: PAYLOAD_NOT_AVAILABLE,
            qos: 2,
        };

        match entity.entity_type {
            EntityType::Light => {
                let mut light = LightDiscovery {
                    base,
                    platform: entity.entity_type.platform(),
                    command_topic: topics.command_topic(entity),
                    state_topic: topics.state_topic(entity),
                    schema: "json",
                    name: "Light",
                    unique_id: entity.system_name.clone(),
                    supported_color_modes: vec!["onoff"],
                    brightness: None,
                    brightness_scale: None,
                    optimistic: false,
                };

                if entity.has(Capability::Brightness) {
                    light.supported_color_modes = vec!["brightness"];
                    light.brightness = Some(true);
                    light.brightness_scale = Some(100);
                }

                DiscoveryPayload::Light(light)
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Split a camel-cased device label into words: `KitchenLamp` -> `Kitchen Lamp`
fn humanize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        let boundary = c.is_ascii_uppercase() || c.is_ascii_digit();
        if boundary && !out.is_empty() && !out.ends_with(' ') {
            out.push(' ');
        }
        out.push(c);
    }
    out
}
