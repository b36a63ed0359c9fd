//! Closed catalogue of supported devices and candidate validation.

use crate::entity::CapabilitySet;
use crate::entity::Entity;
use crate::entity::EntityType;

/// A (manufacturer, model, version, type) tuple the bridge knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedDevice {
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub version: &'static str,
    pub device_type: EntityType,
}

pub static SUPPORTED_DEVICES: &[SupportedDevice] = &[SupportedDevice {
    manufacturer: "jonasclaes.be",
    model: "LIGHT-UA",
    version: "v2.0.0",
    device_type: EntityType::Light,
}];

/// Exact-match membership test against the catalogue
pub fn is_supported(manufacturer: &str, model: &str, version: &str, device_type: &str) -> bool {
    SUPPORTED_DEVICES.iter().any(|device| {
        device.manufacturer == manufacturer
            && device.model == model
            && device.version == version
            && device.device_type.to_string() == device_type
    })
}

/// `on_off` iff the on/off flag is true, `brightness` iff the brightness flag
/// is true. Unreadable flags are false.
pub fn resolve_capabilities(on_off: Option<bool>, brightness: Option<bool>) -> CapabilitySet {
    CapabilitySet::from_flags(on_off, brightness)
}

/// Raw `device` sub-tree values read for one candidate. `None` means the
/// read failed or returned a value of the wrong type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidate {
    pub system_name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub device_type: Option<String>,
    pub on_off: Option<bool>,
    pub brightness: Option<bool>,
    pub name: Option<String>,
}

/// Why a candidate was not turned into an entity
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("device field '{0}' is unreadable")]
    MissingField(&'static str),

    #[error("{manufacturer}/{model}/{version}/{device_type} is not in the supported device catalogue")]
    Unsupported {
        manufacturer: String,
        model: String,
        version: String,
        device_type: String,
    },

    #[error("device name is empty")]
    EmptyName,
}

impl Candidate {
    pub fn new(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
            ..Default::default()
        }
    }

    /// Validate against the catalogue and materialize the entity
    pub fn into_entity(self) -> Result<Entity, Rejection> {
        let manufacturer = self.manufacturer.ok_or(Rejection::MissingField("manufacturer"))?;
        let model = self.model.ok_or(Rejection::MissingField("model"))?;
        let version = self.version.ok_or(Rejection::MissingField("version"))?;
        let device_type = self.device_type.ok_or(Rejection::MissingField("type"))?;
        let name = self.name.ok_or(Rejection::MissingField("name"))?;

        if !is_supported(&manufacturer, &model, &version, &device_type) {
            return Err(Rejection::Unsupported {
                manufacturer,
                model,
                version,
                device_type,
            });
        }

        if name.is_empty() {
            return Err(Rejection::EmptyName);
        }

        // Every catalogue entry carries a parseable type, so this only fails
        // if the catalogue holds a type string EntityType cannot represent.
        let entity_type = device_type.parse().map_err(|_| Rejection::Unsupported {
            manufacturer: manufacturer.clone(),
            model: model.clone(),
            version: version.clone(),
            device_type: device_type.clone(),
        })?;

        Ok(Entity {
            system_name: self.system_name,
            manufacturer,
            model,
            version,
            entity_type,
            capabilities: resolve_capabilities(self.on_off, self.brightness),
            display_name: name,
        })
    }
}
