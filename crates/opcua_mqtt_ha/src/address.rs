//! Hierarchical address construction for an entity's data points.
//!
//! Every step consumes the builder and returns the next, narrower type, so
//! `device().capabilities().brightness()` compiles while `capabilities()` on
//! an entity does not. Each segment is appended as `."<name>"`:
//!
//! ```text
//! ns=3;s="SmartHome_Data"."Lamp1"."control"."on"
//! ```

#[derive(Debug)]
struct Path(String);

impl Path {
    fn push(self, segment: &str) -> Self {
        Path(format!("{}.\"{}\"", self.0, segment))
    }
}

/// Entry point: a root address and nothing else
#[derive(Debug)]
pub struct AddressBuilder(Path);

impl AddressBuilder {
    pub fn new(root: &str) -> Self {
        Self(Path(root.to_string()))
    }

    pub fn entity(self, system_name: &str) -> EntityAddress {
        EntityAddress(self.0.push(system_name))
    }
}

#[derive(Debug)]
pub struct EntityAddress(Path);

impl EntityAddress {
    /// Identity and capability metadata, read once at discovery
    pub fn device(self) -> DeviceAddress {
        DeviceAddress(self.0.push("device"))
    }

    /// Live state reported by the device
    pub fn status(self) -> StatusAddress {
        StatusAddress(self.0.push("status"))
    }

    /// Points the bridge writes to
    pub fn control(self) -> ControlAddress {
        ControlAddress(self.0.push("control"))
    }
}

#[derive(Debug)]
pub struct DeviceAddress(Path);

impl DeviceAddress {
    pub fn manufacturer(self) -> String {
        self.0.push("manufacturer").0
    }

    pub fn model(self) -> String {
        self.0.push("model").0
    }

    pub fn version(self) -> String {
        self.0.push("version").0
    }

    pub fn device_type(self) -> String {
        self.0.push("type").0
    }

    pub fn name(self) -> String {
        self.0.push("name").0
    }

    pub fn capabilities(self) -> CapabilitiesAddress {
        CapabilitiesAddress(self.0.push("capabilities"))
    }
}

#[derive(Debug)]
pub struct CapabilitiesAddress(Path);

impl CapabilitiesAddress {
    pub fn on_off(self) -> String {
        self.0.push("on_off").0
    }

    pub fn brightness(self) -> String {
        self.0.push("brightness").0
    }
}

#[derive(Debug)]
pub struct StatusAddress(Path);

impl StatusAddress {
    /// The `status` node itself, used for change subscriptions
    pub fn path(self) -> String {
        self.0 .0
    }

    pub fn on_off(self) -> String {
        self.0.push("on").0
    }

    pub fn brightness(self) -> String {
        self.0.push("brightness").0
    }
}

#[derive(Debug)]
pub struct ControlAddress(Path);

impl ControlAddress {
    pub fn on_off(self) -> String {
        self.0.push("on").0
    }

    pub fn brightness(self) -> String {
        self.0.push("brightness").0
    }
}
