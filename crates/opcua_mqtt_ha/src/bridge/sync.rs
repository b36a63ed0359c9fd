//! Two-way synchronization between one entity's data points and its topics.

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::AddressBuilder;
use crate::address_space::AddressSpace;
use crate::address_space::OpcUaError;
use crate::address_space::TypedValue;
use crate::discovery::DiscoveryPayload;
use crate::entity::Capability;
use crate::entity::CapabilitySet;
use crate::entity::Entity;
use crate::entity::EntityType;
use crate::mqtt::MessageBus;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::topic::TopicBuilder;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to bind status changes: {0}")]
    OpcUa(#[from] OpcUaError),

    #[error("MQTT request failed: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Failed to encode discovery payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Inbound message on a command topic. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct LightCommand {
    #[serde(default)]
    state: Option<Value>,
    #[serde(default)]
    brightness: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
enum BrightnessError {
    #[error("brightness {0} is not an integer")]
    NotNumeric(Value),

    #[error("brightness {0} does not fit a 16-bit control point")]
    OutOfRange(i64),
}

/// Accepts a number, or a string that starts with an integer like `"50"`,
/// `" 50%"` or `"12.5"`. Fractions are truncated toward zero.
fn parse_brightness(raw: &Value) -> Result<i16, BrightnessError> {
    let value = match raw {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => v,
            (None, Some(f)) if f.is_finite() => f.trunc() as i64,
            _ => return Err(BrightnessError::NotNumeric(raw.clone())),
        },
        Value::String(s) => {
            leading_integer(s).ok_or_else(|| BrightnessError::NotNumeric(raw.clone()))?
        }
        _ => return Err(BrightnessError::NotNumeric(raw.clone())),
    };
    i16::try_from(value).map_err(|_| BrightnessError::OutOfRange(value))
}

/// Optional sign and the digits that follow it, up to the first non-digit.
/// `None` when there are no such digits.
fn leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }

    // Too many digits for i64 is still out of range for the control point
    let magnitude = rest[..end].parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    fn is_on(self) -> bool {
        self == SwitchState::On
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on { SwitchState::On } else { SwitchState::Off }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchState::On => write!(f, "on"),
            SwitchState::Off => write!(f, "off"),
        }
    }
}

/// Outbound message on a state topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateMessage {
    pub state: SwitchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<Value>,
}

impl StateMessage {
    /// Shape a status notification for an entity with `capabilities`.
    ///
    /// Returns `None` when a field the capability set requires is missing;
    /// nothing is published for such a notification.
    pub fn from_status(capabilities: &CapabilitySet, status: &Value) -> Option<Self> {
        let fields = status.as_object()?;

        if capabilities.contains(Capability::Brightness) {
            let on = fields.get("on")?;
            let brightness = fields.get("brightness")?;
            Some(Self {
                state: is_truthy(on).into(),
                brightness: Some(brightness.clone()),
            })
        } else if capabilities.contains(Capability::OnOff) {
            let on = fields.get("on")?;
            Some(Self {
                state: is_truthy(on).into(),
                brightness: None,
            })
        } else {
            None
        }
    }
}

/// PLC flags are not always booleans; zero, empty and null count as off
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Result of one toggle-write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The control bit was flipped
    Toggled,
    /// Status already matched the request; nothing written
    AlreadyInState,
    /// A read or the write failed
    Aborted,
}

/// Binds entities to the bus and carries changes both ways.
pub struct SyncEngine<A: AddressSpace, C: MqttClient> {
    address_space: Arc<A>,
    bus: Arc<MessageBus<C>>,
    root_path: String,
    topics: TopicBuilder,
}

impl<A, C> SyncEngine<A, C>
where
    A: AddressSpace + 'static,
    C: MqttClient + 'static,
{
    pub fn new(
        address_space: Arc<A>,
        bus: Arc<MessageBus<C>>,
        root_path: impl Into<String>,
        topics: TopicBuilder,
    ) -> Self {
        Self {
            address_space,
            bus,
            root_path: root_path.into(),
            topics,
        }
    }

    fn address(&self, entity: &Entity) -> crate::address::EntityAddress {
        AddressBuilder::new(&self.root_path).entity(&entity.system_name)
    }

    /// Wire up both directions for `entity`, then announce it.
    ///
    /// The discovery document goes out last so the hub never sends a command
    /// before the command topic is being handled.
    pub async fn register(self: &Arc<Self>, entity: Entity) -> Result<(), SyncError> {
        let entity = Arc::new(entity);

        match entity.entity_type {
            EntityType::Light => {
                self.bind_commands(&entity).await?;
                self.bind_status(&entity).await?;
            }
        }

        let payload = DiscoveryPayload::from_entity(&entity, &self.topics).to_bytes()?;
        let config_topic = self.topics.config_topic(&entity);
        info!(
            "Registering entity {} with Home Assistant on {}",
            entity.system_name, config_topic
        );
        self.bus.publish(&config_topic, &payload).await?;
        Ok(())
    }

    async fn bind_commands(self: &Arc<Self>, entity: &Arc<Entity>) -> Result<(), SyncError> {
        let topic = self.topics.command_topic(entity);

        let engine = Arc::clone(self);
        let target = Arc::clone(entity);
        self.bus.register_handler(
            &topic,
            Arc::new(move |_topic, payload| {
                let engine = Arc::clone(&engine);
                let entity = Arc::clone(&target);
                async move { engine.handle_command(&entity, &payload).await }.boxed()
            }),
        );

        self.bus.subscribe(&topic).await?;
        Ok(())
    }

    async fn bind_status(self: &Arc<Self>, entity: &Arc<Entity>) -> Result<(), SyncError> {
        let path = self.address(entity).status().path();

        let engine = Arc::clone(self);
        let target = Arc::clone(entity);
        self.address_space
            .subscribe_to_changes(
                &path,
                Arc::new(move |status| {
                    let engine = Arc::clone(&engine);
                    let entity = Arc::clone(&target);
                    async move { engine.publish_state(&entity, &status).await }.boxed()
                }),
            )
            .await?;
        Ok(())
    }

    /// Apply one command message. `state` is handled before `brightness`.
    pub async fn handle_command(&self, entity: &Entity, payload: &[u8]) {
        let command: LightCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(
                    "Ignoring malformed command for {}: {}",
                    entity.system_name, e
                );
                return;
            }
        };
        debug!("Command for {}: {:?}", entity.system_name, command);

        // A state that is not "ON" or "OFF" does not cancel the other fields
        match &command.state {
            Some(Value::String(state)) if state == "ON" => {
                self.switch(entity, SwitchState::On).await;
            }
            Some(Value::String(state)) if state == "OFF" => {
                self.switch(entity, SwitchState::Off).await;
            }
            Some(other) => warn!(
                "Ignoring unknown state {} for {}",
                other, entity.system_name
            ),
            None => {}
        }

        if let Some(raw) = command.brightness {
            if !entity.has(Capability::Brightness) {
                warn!(
                    "Ignoring brightness for {}, which has no brightness control",
                    entity.system_name
                );
                return;
            }
            match parse_brightness(&raw) {
                Ok(brightness) => {
                    self.set_brightness(entity, brightness).await;
                }
                Err(e) => warn!("Rejecting command for {}: {}", entity.system_name, e),
            }
        }
    }

    /// Drive the light to `target` through its edge-triggered control bit.
    ///
    /// The control point toggles the output on every change of value, so the
    /// status is checked first and the control bit is flipped only when the
    /// light is not already in the requested state.
    pub async fn switch(&self, entity: &Entity, target: SwitchState) -> ToggleOutcome {
        let status_path = self.address(entity).status().on_off();
        let control_path = self.address(entity).control().on_off();

        let Some(current) = self.address_space.read_bool(&status_path).await else {
            warn!(
                "Cannot turn {} {}: status is unreadable",
                entity.system_name, target
            );
            return ToggleOutcome::Aborted;
        };

        if current == target.is_on() {
            warn!("{} is already {}", entity.system_name, target);
            return ToggleOutcome::AlreadyInState;
        }

        let Some(control) = self.address_space.read_bool(&control_path).await else {
            warn!(
                "Cannot turn {} {}: control is unreadable",
                entity.system_name, target
            );
            return ToggleOutcome::Aborted;
        };

        if !self
            .address_space
            .write_value(&control_path, TypedValue::Boolean(!control))
            .await
        {
            warn!("Failed to turn {} {}", entity.system_name, target);
            return ToggleOutcome::Aborted;
        }

        info!("Turned {} {}", entity.system_name, target);
        ToggleOutcome::Toggled
    }

    pub async fn set_brightness(&self, entity: &Entity, brightness: i16) -> bool {
        let path = self.address(entity).control().brightness();
        let written = self
            .address_space
            .write_value(&path, TypedValue::Int16(brightness))
            .await;
        if written {
            info!("Set {} brightness to {}", entity.system_name, brightness);
        } else {
            warn!(
                "Failed to set {} brightness to {}",
                entity.system_name, brightness
            );
        }
        written
    }

    async fn publish_state(&self, entity: &Entity, status: &Value) {
        let Some(message) = StateMessage::from_status(&entity.capabilities, status) else {
            debug!(
                "Dropping incomplete status for {}: {}",
                entity.system_name, status
            );
            return;
        };

        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode state for {}: {}", entity.system_name, e);
                return;
            }
        };

        let topic = self.topics.state_topic(entity);
        if let Err(e) = self.bus.publish(&topic, &payload).await {
            warn!("Failed to publish state for {}: {}", entity.system_name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::address_space::mock::MockAddressSpace;
    use crate::mqtt::MockMqttClient;

    const ROOT: &str = r#"ns=3;s="SmartHome_Data""#;

    fn lamp(brightness: bool) -> Entity {
        Entity {
            system_name: "Lamp1".to_string(),
            manufacturer: "jonasclaes.be".to_string(),
            model: "LIGHT-UA".to_string(),
            version: "v2.0.0".to_string(),
            entity_type: EntityType::Light,
            capabilities: CapabilitySet::from_flags(Some(true), Some(brightness)),
            display_name: "Kitchen Lamp".to_string(),
        }
    }

    fn paths() -> (String, String, String, String) {
        let address = || AddressBuilder::new(ROOT).entity("Lamp1");
        (
            address().status().path(),
            address().status().on_off(),
            address().control().on_off(),
            address().control().brightness(),
        )
    }

    fn engine() -> (
        Arc<SyncEngine<MockAddressSpace, MockMqttClient>>,
        Arc<MockAddressSpace>,
        Arc<MessageBus<MockMqttClient>>,
    ) {
        let space = Arc::new(MockAddressSpace::new());
        let bus = Arc::new(MessageBus::new(MockMqttClient::new()));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&space),
            Arc::clone(&bus),
            ROOT,
            TopicBuilder::default(),
        ));
        (engine, space, bus)
    }

    #[test]
    fn test_parse_brightness() {
        assert_eq!(parse_brightness(&json!(50)), Ok(50));
        assert_eq!(parse_brightness(&json!("75")), Ok(75));
        assert_eq!(parse_brightness(&json!(" 12 ")), Ok(12));
        assert_eq!(parse_brightness(&json!(42.9)), Ok(42));
        assert_eq!(parse_brightness(&json!("12.5")), Ok(12));
        assert_eq!(parse_brightness(&json!("50%")), Ok(50));
        assert_eq!(parse_brightness(&json!(" -3 lux")), Ok(-3));
        assert_eq!(parse_brightness(&json!("+8")), Ok(8));
        assert!(matches!(
            parse_brightness(&json!("%50")),
            Err(BrightnessError::NotNumeric(_))
        ));
        assert!(matches!(
            parse_brightness(&json!("-")),
            Err(BrightnessError::NotNumeric(_))
        ));
        assert_eq!(
            parse_brightness(&json!("99999999999999999999")),
            Err(BrightnessError::OutOfRange(i64::MAX))
        );
        assert!(matches!(
            parse_brightness(&json!("abc")),
            Err(BrightnessError::NotNumeric(_))
        ));
        assert!(matches!(
            parse_brightness(&json!(true)),
            Err(BrightnessError::NotNumeric(_))
        ));
        assert_eq!(
            parse_brightness(&json!(40000)),
            Err(BrightnessError::OutOfRange(40000))
        );
    }

    #[test]
    fn test_state_message_on_off_entity() {
        let caps = CapabilitySet::from_flags(Some(true), Some(false));
        let message = StateMessage::from_status(&caps, &json!({"on": true, "brightness": 80})).unwrap();
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"state": "ON"})
        );

        let message = StateMessage::from_status(&caps, &json!({"on": 0})).unwrap();
        assert_eq!(message.state, SwitchState::Off);

        assert_eq!(StateMessage::from_status(&caps, &json!({"brightness": 80})), None);
    }

    #[test]
    fn test_state_message_brightness_entity() {
        let caps = CapabilitySet::from_flags(Some(true), Some(true));
        let message =
            StateMessage::from_status(&caps, &json!({"on": false, "brightness": 35})).unwrap();
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"state": "OFF", "brightness": 35})
        );

        // Both fields are required before anything is published
        assert_eq!(StateMessage::from_status(&caps, &json!({"on": true})), None);
        assert_eq!(StateMessage::from_status(&caps, &json!(true)), None);
    }

    #[test]
    fn test_state_message_without_capabilities() {
        let caps = CapabilitySet::from_flags(None, None);
        assert_eq!(StateMessage::from_status(&caps, &json!({"on": true})), None);
    }

    #[tokio::test]
    async fn test_turn_on_flips_control_bit() {
        let (engine, space, _bus) = engine();
        let (_, status_on, control_on, _) = paths();
        space.set_value(&status_on, json!(false));
        space.set_value(&control_on, json!(true));

        let outcome = engine.switch(&lamp(false), SwitchState::On).await;

        assert_eq!(outcome, ToggleOutcome::Toggled);
        assert_eq!(space.writes(), vec![(control_on, TypedValue::Boolean(false))]);
    }

    #[tokio::test]
    async fn test_turn_on_twice_writes_once() {
        let (engine, space, _bus) = engine();
        let (_, status_on, control_on, _) = paths();
        space.set_value(&status_on, json!(false));
        space.set_value(&control_on, json!(false));

        engine
            .handle_command(&lamp(false), br#"{"state":"ON"}"#)
            .await;
        // The device reports the new state before the second command
        space.set_value(&status_on, json!(true));
        engine
            .handle_command(&lamp(false), br#"{"state":"ON"}"#)
            .await;

        assert_eq!(space.writes(), vec![(control_on, TypedValue::Boolean(true))]);
    }

    #[tokio::test]
    async fn test_turn_off_when_already_off_is_skipped() {
        let (engine, space, _bus) = engine();
        let (_, status_on, control_on, _) = paths();
        space.set_value(&status_on, json!(false));
        space.set_value(&control_on, json!(true));

        let outcome = engine.switch(&lamp(false), SwitchState::Off).await;

        assert_eq!(outcome, ToggleOutcome::AlreadyInState);
        assert!(space.writes().is_empty());
        // Control is never read when the status already matches
        assert!(!space.reads().contains(&control_on));
    }

    #[tokio::test]
    async fn test_unreadable_status_aborts_toggle() {
        let (engine, space, _bus) = engine();
        let (_, _, control_on, _) = paths();
        space.set_value(&control_on, json!(true));

        let outcome = engine.switch(&lamp(false), SwitchState::On).await;

        assert_eq!(outcome, ToggleOutcome::Aborted);
        assert!(space.writes().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_write_aborts_toggle() {
        let (engine, space, _bus) = engine();
        let (_, status_on, control_on, _) = paths();
        space.set_value(&status_on, json!(true));
        space.set_value(&control_on, json!(true));
        space.reject_writes(&control_on);

        let outcome = engine.switch(&lamp(false), SwitchState::Off).await;

        assert_eq!(outcome, ToggleOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_brightness_command_writes_int16() {
        let (engine, space, _bus) = engine();
        let (_, _, _, control_brightness) = paths();

        engine
            .handle_command(&lamp(true), br#"{"brightness":"60"}"#)
            .await;

        assert_eq!(
            space.writes(),
            vec![(control_brightness, TypedValue::Int16(60))]
        );
    }

    #[tokio::test]
    async fn test_non_numeric_brightness_writes_nothing() {
        let (engine, space, _bus) = engine();

        engine
            .handle_command(&lamp(true), br#"{"brightness":"abc"}"#)
            .await;
        engine.handle_command(&lamp(true), b"not json").await;

        assert!(space.writes().is_empty());
    }

    #[tokio::test]
    async fn test_state_and_brightness_are_both_applied() {
        let (engine, space, _bus) = engine();
        let (_, status_on, control_on, control_brightness) = paths();
        space.set_value(&status_on, json!(false));
        space.set_value(&control_on, json!(false));

        engine
            .handle_command(&lamp(true), br#"{"state":"ON","brightness":30}"#)
            .await;

        assert_eq!(
            space.writes(),
            vec![
                (control_on, TypedValue::Boolean(true)),
                (control_brightness, TypedValue::Int16(30)),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_string_state_still_applies_brightness() {
        let (engine, space, _bus) = engine();
        let (_, _, _, control_brightness) = paths();

        engine
            .handle_command(&lamp(true), br#"{"state":1,"brightness":40}"#)
            .await;

        assert_eq!(
            space.writes(),
            vec![(control_brightness, TypedValue::Int16(40))]
        );
    }

    #[tokio::test]
    async fn test_brightness_ignored_without_capability() {
        let (engine, space, _bus) = engine();

        engine
            .handle_command(&lamp(false), br#"{"brightness":30}"#)
            .await;

        assert!(space.writes().is_empty());
    }

    #[tokio::test]
    async fn test_register_binds_then_announces() {
        let (engine, space, bus) = engine();
        let (status, _, _, _) = paths();
        let topics = TopicBuilder::default();
        let entity = lamp(false);

        engine.register(entity.clone()).await.unwrap();

        assert_eq!(
            *bus.client().subscriptions.lock().unwrap(),
            vec![topics.command_topic(&entity)]
        );
        assert_eq!(space.subscribed_paths(), vec![status]);

        let announced = bus.client().published_to(&topics.config_topic(&entity));
        assert_eq!(announced.len(), 1);
        let document: Value = serde_json::from_slice(&announced[0].0).unwrap();
        assert_eq!(document["unique_id"], "Lamp1");
    }

    #[tokio::test]
    async fn test_status_change_publishes_state() {
        let (engine, space, bus) = engine();
        let (status, _, _, _) = paths();
        let topics = TopicBuilder::default();
        let entity = lamp(false);
        engine.register(entity.clone()).await.unwrap();

        space
            .notify(&status, json!({"on": true, "brightness": 100}))
            .await;

        let published = bus.client().published_to(&topics.state_topic(&entity));
        assert_eq!(published.len(), 1);
        let state: Value = serde_json::from_slice(&published[0].0).unwrap();
        assert_eq!(state, json!({"state": "ON"}));
    }

    #[tokio::test]
    async fn test_incomplete_status_publishes_nothing() {
        let (engine, space, bus) = engine();
        let (status, _, _, _) = paths();
        let topics = TopicBuilder::default();
        let entity = lamp(true);
        engine.register(entity.clone()).await.unwrap();

        space.notify(&status, json!({"on": true})).await;

        assert!(bus.client().published_to(&topics.state_topic(&entity)).is_empty());
    }

    #[tokio::test]
    async fn test_command_over_bus_reaches_control_point() {
        let (engine, space, bus) = engine();
        let (_, status_on, control_on, _) = paths();
        space.set_value(&status_on, json!(true));
        space.set_value(&control_on, json!(true));
        let topics = TopicBuilder::default();
        let entity = lamp(false);
        engine.register(entity.clone()).await.unwrap();
        bus.connect().await.unwrap();

        bus.client()
            .add_message(&topics.command_topic(&entity), br#"{"state":"OFF"}"#);

        let expected = vec![(control_on, TypedValue::Boolean(false))];
        tokio::time::timeout(Duration::from_secs(1), async {
            while space.writes() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
