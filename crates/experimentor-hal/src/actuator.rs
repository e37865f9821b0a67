//! Actuators: channels that change the experiment (a piezo stage, a laser
//! power setpoint, a shutter).
//!
//! An actuator's properties are fixed at construction.  It is attached to a
//! [`Device`] once and every value goes through that device's driver.
//! Setting a value talks to real hardware.

use std::sync::Arc;

use experimentor_types::ExpError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::device::Device;

/// Inclusive range an actuator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
}

impl Limits {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

pub struct Actuator {
    name: String,
    properties: Map<String, Value>,
    limits: Option<Limits>,
    device: Option<Arc<Device>>,
    value: Option<Value>,
}

impl Actuator {
    /// Build an actuator from its properties.  `name` is mandatory; an
    /// optional `limits = { min, max }` bounds numeric values.
    pub fn new(properties: Map<String, Value>) -> Result<Self, ExpError> {
        let Some(name) = properties.get("name").and_then(Value::as_str) else {
            error!("initializing actuator without name");
            return Err(ExpError::InvalidModel("all actuators need a name".to_string()));
        };
        let name = name.to_string();
        let limits = match properties.get("limits") {
            Some(raw) => Some(serde_json::from_value::<Limits>(raw.clone()).map_err(|e| {
                ExpError::InvalidModel(format!("limits of actuator {name}: {e}"))
            })?),
            None => None,
        };
        info!(actuator = %name, "started actuator");
        Ok(Self {
            name,
            properties,
            limits,
            device: None,
            value: None,
        })
    }

    /// Shorthand for an actuator with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut properties = Map::new();
        properties.insert("name".to_string(), Value::String(name.clone()));
        Self {
            name,
            properties,
            limits: None,
            device: None,
            value: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn limits(&self) -> Option<Limits> {
        self.limits
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    /// Attach the device this actuator is wired to.
    ///
    /// # Errors
    ///
    /// [`ExpError::InvalidModel`] if a device is already attached.
    pub fn attach(&mut self, device: Arc<Device>) -> Result<(), ExpError> {
        if let Some(current) = &self.device {
            error!(actuator = %self.name, device = %current, "trying to override an actuator's device");
            return Err(ExpError::InvalidModel(format!(
                "actuator {} is already attached to {current}",
                self.name
            )));
        }
        self.device = Some(device);
        Ok(())
    }

    /// Last value successfully applied.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Apply `value` through the attached device.
    ///
    /// # Errors
    ///
    /// - [`ExpError::DriverNotInitialized`] without a device (or driver).
    /// - [`ExpError::OutOfLimits`] when `value` is outside the limits.
    /// - Whatever the driver reports.
    pub fn set_value(&mut self, value: Value) -> Result<(), ExpError> {
        let Some(device) = &self.device else {
            error!(actuator = %self.name, "updating a value before connecting to a device");
            return Err(ExpError::DriverNotInitialized {
                device: format!("<none> (actuator {})", self.name),
            });
        };
        if let Some(limits) = self.limits {
            let Some(number) = value.as_f64() else {
                return Err(ExpError::InvalidModel(format!(
                    "actuator {} has limits but {value} is not a number",
                    self.name
                )));
            };
            if !limits.contains(number) {
                warn!(actuator = %self.name, value = number, min = limits.min, max = limits.max, "value outside limits");
                return Err(ExpError::OutOfLimits {
                    name: self.name.clone(),
                    value: number,
                    min: limits.min,
                    max: limits.max,
                });
            }
        }
        if let Err(e) = device.apply_value(self, &value) {
            error!(actuator = %self.name, %value, error = %e, "failed to apply value");
            return Err(e);
        }
        self.value = Some(value);
        Ok(())
    }
}
