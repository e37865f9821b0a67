//! Sensors: channels that read from the experiment (a photodiode, a
//! thermocouple).  Every read goes to the hardware through the attached
//! [`Device`].

use std::sync::Arc;

use experimentor_types::ExpError;
use serde_json::{Map, Value};
use tracing::error;

use crate::device::Device;

pub struct Sensor {
    name: String,
    properties: Map<String, Value>,
    device: Option<Arc<Device>>,
}

impl Sensor {
    /// `name` is the only mandatory property.
    pub fn new(properties: Map<String, Value>) -> Result<Self, ExpError> {
        let Some(name) = properties.get("name").and_then(Value::as_str) else {
            error!("initializing sensor without name");
            return Err(ExpError::InvalidModel("all sensors need a name".to_string()));
        };
        Ok(Self {
            name: name.to_string(),
            properties,
            device: None,
        })
    }

    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut properties = Map::new();
        properties.insert("name".to_string(), Value::String(name.clone()));
        Self {
            name,
            properties,
            device: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Attach (or re-attach) the device this sensor is read through.
    pub fn attach(&mut self, device: Arc<Device>) {
        self.device = Some(device);
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    /// Read the current value from the hardware.
    ///
    /// # Errors
    ///
    /// [`ExpError::DriverNotInitialized`] without a device (or driver).
    pub fn read(&self) -> Result<Value, ExpError> {
        let Some(device) = &self.device else {
            error!(sensor = %self.name, "reading but there is no device associated");
            return Err(ExpError::DriverNotInitialized {
                device: format!("<none> (sensor {})", self.name),
            });
        };
        device.read_value(self)
    }
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
