use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::debug;
use tracing::info;

use crate::address::AddressBuilder;
use crate::address_space::AddressSpace;
use crate::address_space::OpcUaError;
use crate::catalogue::Candidate;
use crate::entity::Entity;

/// Upper bound on candidates probed at once
const DISCOVERY_CONCURRENCY: usize = 16;

/// Finds the supported devices below the root node.
pub struct EntityDiscovery<A: AddressSpace> {
    address_space: Arc<A>,
    root_path: String,
}

impl<A: AddressSpace> EntityDiscovery<A> {
    pub fn new(address_space: Arc<A>, root_path: impl Into<String>) -> Self {
        Self {
            address_space,
            root_path: root_path.into(),
        }
    }

    /// Browse the root and keep every child whose device metadata matches the
    /// catalogue. Entities come back in browse order; a candidate with
    /// unreadable metadata is skipped, never fatal.
    pub async fn discover(&self) -> Result<Vec<Entity>, OpcUaError> {
        info!("Discovering entities below {}", self.root_path);
        let names = self.address_space.browse_children(&self.root_path).await?;
        let total = names.len();

        let mut results: Vec<(usize, String, Result<Entity, _>)> =
            stream::iter(names.into_iter().enumerate())
                .map(|(index, name)| async move {
                    let outcome = self.probe(&name).await.into_entity();
                    (index, name, outcome)
                })
                .buffer_unordered(DISCOVERY_CONCURRENCY)
                .collect()
                .await;
        results.sort_by_key(|(index, _, _)| *index);

        let mut entities = Vec::new();
        for (_, name, outcome) in results {
            match outcome {
                Ok(entity) => {
                    info!("Discovered entity {}", entity);
                    entities.push(entity);
                }
                Err(reason) => info!("Skipping {}: {}", name, reason),
            }
        }

        info!(
            "Discovered {} entities of which {} are supported",
            total,
            entities.len()
        );
        Ok(entities)
    }

    async fn probe(&self, system_name: &str) -> Candidate {
        debug!("Probing {}", system_name);
        let device = || AddressBuilder::new(&self.root_path).entity(system_name).device();
        let space = &self.address_space;

        let mut candidate = Candidate::new(system_name);
        candidate.manufacturer = space.read_string(&device().manufacturer()).await;
        candidate.model = space.read_string(&device().model()).await;
        candidate.version = space.read_string(&device().version()).await;
        candidate.device_type = space.read_string(&device().device_type()).await;
        candidate.on_off = space.read_bool(&device().capabilities().on_off()).await;
        candidate.brightness = space.read_bool(&device().capabilities().brightness()).await;
        candidate.name = space.read_string(&device().name()).await;
        candidate
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::address_space::mock::MockAddressSpace;
    use crate::entity::Capability;

    const ROOT: &str = r#"ns=3;s="SmartHome_Data""#;

    fn add_device(space: &MockAddressSpace, name: &str, model: &str, brightness: bool) {
        let device = || AddressBuilder::new(ROOT).entity(name).device();
        space.set_value(&device().manufacturer(), json!("jonasclaes.be"));
        space.set_value(&device().model(), json!(model));
        space.set_value(&device().version(), json!("v2.0.0"));
        space.set_value(&device().device_type(), json!("LIGHT"));
        space.set_value(&device().capabilities().on_off(), json!(true));
        space.set_value(&device().capabilities().brightness(), json!(brightness));
        space.set_value(&device().name(), json!(format!("{}Name", name)));
    }

    #[tokio::test]
    async fn test_discover_keeps_only_supported_devices() {
        let space = Arc::new(MockAddressSpace::new());
        space.set_children(ROOT, &["Lamp1", "Dimmer", "Lamp2", "Pump"]);
        add_device(&space, "Lamp1", "LIGHT-UA", false);
        add_device(&space, "Dimmer", "DIMMER-UA", true);
        add_device(&space, "Lamp2", "LIGHT-UA", true);
        // Pump has no device metadata at all

        let entities = EntityDiscovery::new(space, ROOT).discover().await.unwrap();

        let names: Vec<&str> = entities.iter().map(|e| e.system_name.as_str()).collect();
        assert_eq!(names, vec!["Lamp1", "Lamp2"]);
        assert!(entities[0].has(Capability::OnOff));
        assert!(!entities[0].has(Capability::Brightness));
        assert!(entities[1].has(Capability::Brightness));
        assert_eq!(entities[1].display_name, "Lamp2Name");
    }

    #[tokio::test]
    async fn test_discover_empty_root() {
        let space = Arc::new(MockAddressSpace::new());
        let entities = EntityDiscovery::new(space, ROOT).discover().await.unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn test_wrongly_typed_metadata_is_unsupported() {
        let space = Arc::new(MockAddressSpace::new());
        space.set_children(ROOT, &["Lamp1"]);
        add_device(&space, "Lamp1", "LIGHT-UA", false);
        let version = AddressBuilder::new(ROOT).entity("Lamp1").device().version();
        space.set_value(&version, json!(2));

        let entities = EntityDiscovery::new(space, ROOT).discover().await.unwrap();
        assert!(entities.is_empty());
    }
}
