//! Instrument drivers and how they are found.
//!
//! Vendor drivers live outside this workspace.  All the device layer needs is
//! the [`Driver`] trait: set a named parameter, read a named parameter.  The
//! [`DriverRegistry`] maps the `driver` key of a device's properties to a
//! constructor, so an experiment file can say `driver = "sim"` and get a live
//! driver without any dynamic loading.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use experimentor_types::ExpError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::sim::SimDriver;

/// An instrument driver.
///
/// Parameters are addressed by name; values are JSON values so that numbers,
/// strings and small records all fit without unit handling here.
pub trait Driver: Send {
    /// Identifier of this driver instance, used in log lines.
    fn id(&self) -> &str;

    /// Write `value` to parameter `key`.
    ///
    /// # Errors
    ///
    /// [`ExpError::HardwareFault`] if the instrument rejects the value.
    fn set(&mut self, key: &str, value: &Value) -> Result<(), ExpError>;

    /// Read parameter `key` from the instrument.
    fn get(&mut self, key: &str) -> Result<Value, ExpError>;

    /// Drive an actuator channel.  Defaults to [`Driver::set`] on the
    /// channel name.
    fn apply_value(&mut self, channel: &str, value: &Value) -> Result<(), ExpError> {
        self.set(channel, value)
    }

    /// Read a sensor channel.  Defaults to [`Driver::get`] on the channel
    /// name.
    fn read_value(&mut self, channel: &str) -> Result<Value, ExpError> {
        self.get(channel)
    }
}

/// How a driver reaches its instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Connection {
    Gpib { port: String },
    Usb,
    Serial { port: String },
    Daq { port: String },
    /// In-process simulation, no hardware.
    Sim,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connection::Gpib { port } => write!(f, "GPIB({port})"),
            Connection::Usb => f.write_str("USB"),
            Connection::Serial { port } => write!(f, "serial({port})"),
            Connection::Daq { port } => write!(f, "DAQ({port})"),
            Connection::Sim => f.write_str("sim"),
        }
    }
}

/// Builds a driver for a connection.
pub type DriverConstructor =
    Arc<dyn Fn(&Connection) -> Result<Box<dyn Driver>, ExpError> + Send + Sync>;

/// Driver key → constructor, populated at startup.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the simulated drivers:
    ///
    /// | Key | Behaviour |
    /// |---|---|
    /// | `sim` | [`SimDriver`] that stores whatever it is given |
    /// | `sim/unreachable` | constructor that always fails, as a disconnected instrument would |
    pub fn with_sim_drivers() -> Self {
        let mut registry = Self::new();
        registry.register("sim", |conn| {
            Ok(Box::new(SimDriver::new(format!("sim@{conn}"))) as Box<dyn Driver>)
        });
        registry.register("sim/unreachable", |conn| {
            Err(ExpError::HardwareFault {
                component: "sim/unreachable".to_string(),
                details: format!("no instrument answers on {conn}"),
            })
        });
        registry
    }

    /// Register `constructor` under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn(&Connection) -> Result<Box<dyn Driver>, ExpError> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Arc::new(constructor));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Build the driver registered under `key`.
    ///
    /// # Errors
    ///
    /// [`ExpError::UnknownDriver`] for an unregistered key, otherwise
    /// whatever the constructor returns.
    pub fn create(&self, key: &str, connection: &Connection) -> Result<Box<dyn Driver>, ExpError> {
        let constructor = self
            .constructors
            .get(key)
            .ok_or_else(|| ExpError::UnknownDriver(key.to_string()))?;
        constructor(connection)
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
