//! Entity model shared by discovery, topics, payloads and synchronization.

use std::fmt;

use strum::Display;
use strum::EnumString;
use strum::IntoStaticStr;

/// Logical device type as reported by the `device.type` data point.
///
/// The set is closed: a type string that does not parse is an unsupported
/// candidate, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum EntityType {
    #[strum(serialize = "LIGHT")]
    Light,
}

impl EntityType {
    /// Home Assistant platform token for this type
    pub fn platform(self) -> &'static str {
        match self {
            EntityType::Light => "light",
        }
    }
}

/// An optional feature of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    OnOff,
    Brightness,
}

/// Capabilities derived from the two raw flags read at discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    on_off: bool,
    brightness: bool,
}

impl CapabilitySet {
    /// Each flag maps to its capability independently; unreadable flags count as false.
    pub fn from_flags(on_off: Option<bool>, brightness: Option<bool>) -> Self {
        Self {
            on_off: on_off.unwrap_or(false),
            brightness: brightness.unwrap_or(false),
        }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        match capability {
            Capability::OnOff => self.on_off,
            Capability::Brightness => self.brightness,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.on_off && !self.brightness
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        [Capability::OnOff, Capability::Brightness]
            .into_iter()
            .filter(|c| self.contains(*c))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.iter().map(Into::into).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// One discovered, supported device instance.
///
/// Built once per discovery pass and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Browse name under the root; stable identity for addresses and topics
    pub system_name: String,
    pub manufacturer: String,
    pub model: String,
    pub version: String,
    pub entity_type: EntityType,
    pub capabilities: CapabilitySet,
    /// Human-readable label read from the device
    pub display_name: String,
}

impl Entity {
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entity(system_name={}, manufacturer={}, model={}, version={}, type={}, capabilities={}, name={})",
            self.system_name,
            self.manufacturer,
            self.model,
            self.version,
            self.entity_type,
            self.capabilities,
            self.display_name
        )
    }
}
