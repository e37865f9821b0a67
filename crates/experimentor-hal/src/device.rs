//! [`Device`] – the only thing that talks to a driver.
//!
//! Actuators, sensors and features never hold a driver themselves; they go
//! through their device, which keeps the driver, the latest applied
//! parameters and the [`Properties`] cache behind one lock.

use std::fmt;

use experimentor_types::ExpError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::actuator::Actuator;
use crate::driver::{Connection, Driver, DriverRegistry};
use crate::feature::{Feature, FeatureInfo, FeatureMap};
use crate::properties::Properties;
use crate::sensor::Sensor;

/// Construction-time description of a device, usually one `[[devices]]`
/// table of an experiment file.  Immutable once the device exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Key into the [`DriverRegistry`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
    /// Anything else the device file carries (defaults, channel lists, …).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceProperties {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>, connection: Connection) -> Self {
        self.driver = Some(driver.into());
        self.connection = Some(connection);
        self
    }
}

/// Outcome of [`Device::apply_values`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub failed: Vec<(String, ExpError)>,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct DeviceState {
    driver: Option<Box<dyn Driver>>,
    params: Map<String, Value>,
    cache: Properties,
    features: FeatureMap,
}

pub struct Device {
    name: String,
    properties: DeviceProperties,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(properties: DeviceProperties) -> Self {
        let name = match &properties.name {
            Some(name) => {
                debug!(device = %name, "loaded device properties");
                name.clone()
            }
            None => {
                debug!("loaded properties of a device without name");
                "nameless".to_string()
            }
        };
        Self {
            name,
            properties,
            state: Mutex::new(DeviceState {
                driver: None,
                params: Map::new(),
                cache: Properties::new(),
                features: FeatureMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Install an already-built driver, replacing any previous one.
    pub fn add_driver(&self, driver: Box<dyn Driver>) {
        debug!(device = %self.name, driver = driver.id(), "driver added");
        self.state.lock().driver = Some(driver);
    }

    pub fn has_driver(&self) -> bool {
        self.state.lock().driver.is_some()
    }

    /// Build the driver named by `properties.driver` for
    /// `properties.connection`.
    ///
    /// A device without a driver key (or without a connection) is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// [`ExpError::DriverInit`] if the key is unknown or the constructor
    /// fails.
    pub fn initialize_driver(&self, registry: &DriverRegistry) -> Result<(), ExpError> {
        let Some(key) = &self.properties.driver else {
            debug!(device = %self.name, "no driver configured");
            return Ok(());
        };
        let Some(connection) = &self.properties.connection else {
            warn!(device = %self.name, driver = %key, "driver configured without a connection");
            return Ok(());
        };
        info!(device = %self.name, driver = %key, %connection, "initializing driver");
        match registry.create(key, connection) {
            Ok(driver) => {
                self.state.lock().driver = Some(driver);
                Ok(())
            }
            Err(e) => {
                error!(device = %self.name, %connection, error = %e, "driver not initialized");
                Err(ExpError::DriverInit {
                    device: self.name.clone(),
                    details: e.to_string(),
                })
            }
        }
    }

    fn not_initialized(&self) -> ExpError {
        ExpError::DriverNotInitialized {
            device: self.name.clone(),
        }
    }

    /// Write every entry of `values` to the driver.
    ///
    /// A key [linked](Self::link) to a driver method is written under that
    /// method's name; params and the cache still use the property key.
    /// A key the driver rejects is logged and skipped; the others are still
    /// applied.  Successful keys are recorded in [`params`](Self::params) and
    /// confirmed in the property cache.
    ///
    /// # Errors
    ///
    /// [`ExpError::DriverNotInitialized`] if there is no driver yet.
    pub fn apply_values(&self, values: &Map<String, Value>) -> Result<ApplyReport, ExpError> {
        let mut state = self.state.lock();
        let DeviceState {
            driver,
            params,
            cache,
            ..
        } = &mut *state;
        let Some(driver) = driver.as_mut() else {
            error!(device = %self.name, "trying to apply values before initializing the driver");
            return Err(self.not_initialized());
        };

        let mut report = ApplyReport::default();
        for (key, value) in values {
            let target = cache.linked(key).unwrap_or(key.as_str()).to_string();
            info!(device = %self.name, key = %key, method = %target, %value, "setting value");
            match driver.set(&target, value) {
                Ok(()) => {
                    params.insert(key.clone(), value.clone());
                    cache.record(key, value.clone());
                    report.applied.push(key.clone());
                }
                Err(e) => {
                    error!(device = %self.name, key = %key, error = %e, "problem setting value");
                    report.failed.push((key.clone(), e));
                }
            }
        }
        Ok(report)
    }

    /// Drive `actuator`'s channel to `value`.
    pub fn apply_value(&self, actuator: &Actuator, value: &Value) -> Result<(), ExpError> {
        let mut state = self.state.lock();
        let driver = state.driver.as_mut().ok_or_else(|| self.not_initialized())?;
        driver.apply_value(actuator.name(), value)
    }

    /// Read `sensor`'s channel.
    pub fn read_value(&self, sensor: &Sensor) -> Result<Value, ExpError> {
        let mut state = self.state.lock();
        let driver = state.driver.as_mut().ok_or_else(|| self.not_initialized())?;
        driver.read_value(sensor.name())
    }

    /// Latest successfully applied value per key.
    pub fn params(&self) -> Map<String, Value> {
        self.state.lock().params.clone()
    }

    // -----------------------------------------------------------------------
    // Property cache
    // -----------------------------------------------------------------------

    /// Stage values for a later [`apply_pending`](Self::apply_pending).
    pub fn stage(&self, values: &Map<String, Value>) {
        self.state
            .lock()
            .cache
            .update(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Snapshot of the property cache.
    pub fn cache(&self) -> Properties {
        self.state.lock().cache.clone()
    }

    /// Route properties to differently named driver methods, e.g.
    /// `("exposure_time", "EXP")`.
    ///
    /// # Errors
    ///
    /// [`ExpError::Property`] if a key is already linked.
    pub fn link<I, K, M>(&self, links: I) -> Result<(), ExpError>
    where
        I: IntoIterator<Item = (K, M)>,
        K: Into<String>,
        M: Into<String>,
    {
        self.state.lock().cache.link(links)
    }

    pub fn unlink<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.state.lock().cache.unlink(keys);
    }

    /// Push every staged value through [`apply_values`](Self::apply_values).
    /// Values the driver rejected stay staged.
    pub fn apply_pending(&self) -> Result<ApplyReport, ExpError> {
        let pending = self.state.lock().cache.to_update();
        if pending.is_empty() {
            return Ok(ApplyReport::default());
        }
        self.apply_values(&pending)
    }

    // -----------------------------------------------------------------------
    // Features
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// [`ExpError::Property`] if a feature with that name exists.
    pub fn add_feature(&self, feature: Box<dyn Feature>) -> Result<(), ExpError> {
        self.state.lock().features.insert(feature)
    }

    pub fn get_feature(&self, name: &str) -> Result<Value, ExpError> {
        self.with_feature(name, |feature, driver| feature.get(driver))
    }

    pub fn set_feature(&self, name: &str, value: Value) -> Result<Value, ExpError> {
        self.with_feature(name, |feature, driver| feature.set(driver, value))
    }

    pub fn describe_features(&self) -> Vec<FeatureInfo> {
        self.state.lock().features.describe()
    }

    fn with_feature<F>(&self, name: &str, op: F) -> Result<Value, ExpError>
    where
        F: FnOnce(&mut dyn Feature, &mut dyn Driver) -> Result<Value, ExpError>,
    {
        let mut state = self.state.lock();
        let DeviceState {
            driver,
            cache,
            features,
            ..
        } = &mut *state;
        let feature = features.get_mut(name).ok_or_else(|| ExpError::Property {
            name: name.to_string(),
            details: format!("{} has no such feature", self.name),
        })?;
        let driver = driver.as_mut().ok_or_else(|| self.not_initialized())?;
        let value = op(feature.as_mut(), driver.as_mut())?;
        cache.record(name, value.clone());
        Ok(value)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("has_driver", &self.has_driver())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{DriverFeature, Setting};
    use crate::sim::SimDriver;
    use serde_json::json;

    fn values(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn nameless_device_gets_placeholder_name() {
        let device = Device::new(DeviceProperties::default());
        assert_eq!(device.name(), "nameless");
        assert_eq!(device.to_string(), "nameless");
    }

    #[test]
    fn apply_before_driver_is_an_error() {
        let device = Device::new(DeviceProperties::named("laser"));
        let err = device.apply_values(&values(json!({"power": 1}))).unwrap_err();
        assert_eq!(
            err,
            ExpError::DriverNotInitialized {
                device: "laser".to_string()
            }
        );
        assert!(device.params().is_empty());
    }

    #[test]
    fn apply_values_skips_failing_keys() {
        let device = Device::new(DeviceProperties::named("laser"));
        let sim = SimDriver::new("laser-sim").with_failing_keys(["b"]);
        let log = sim.write_log();
        device.add_driver(Box::new(sim));

        let report = device
            .apply_values(&values(json!({"a": 1, "b": 2, "c": 3})))
            .unwrap();

        assert_eq!(report.applied, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert!(!report.is_complete());

        assert_eq!(device.params(), values(json!({"a": 1, "c": 3})));
        assert_eq!(
            *log.lock(),
            vec![("a".to_string(), json!(1)), ("c".to_string(), json!(3))]
        );
    }

    #[test]
    fn initialize_driver_from_registry() {
        let registry = DriverRegistry::with_sim_drivers();
        let device = Device::new(DeviceProperties::named("daq").with_driver(
            "sim",
            Connection::Daq {
                port: "1".to_string(),
            },
        ));
        device.initialize_driver(&registry).unwrap();
        assert!(device.has_driver());
    }

    #[test]
    fn initialize_driver_failure_names_device() {
        let registry = DriverRegistry::with_sim_drivers();
        let device = Device::new(
            DeviceProperties::named("stage").with_driver("sim/unreachable", Connection::Usb),
        );
        let err = device.initialize_driver(&registry).unwrap_err();
        assert!(matches!(err, ExpError::DriverInit { ref device, .. } if device == "stage"));
        assert!(!device.has_driver());

        let unknown = Device::new(
            DeviceProperties::named("x").with_driver("vendor/Thing", Connection::Sim),
        );
        assert!(matches!(
            unknown.initialize_driver(&registry),
            Err(ExpError::DriverInit { .. })
        ));
    }

    #[test]
    fn device_without_driver_key_is_left_alone() {
        let device = Device::new(DeviceProperties::named("passive"));
        device
            .initialize_driver(&DriverRegistry::with_sim_drivers())
            .unwrap();
        assert!(!device.has_driver());
    }

    #[test]
    fn linked_properties_use_the_driver_method() {
        let device = Device::new(DeviceProperties::named("cam"));
        let sim = SimDriver::new("cam");
        let log = sim.write_log();
        device.add_driver(Box::new(sim));
        device.link([("exposure_time", "EXP")]).unwrap();
        assert!(device.link([("exposure_time", "set_exposure")]).is_err());

        device.stage(&values(json!({"exposure_time": 20, "gain": 2})));
        let report = device.apply_pending().unwrap();
        assert_eq!(report.applied, vec!["exposure_time", "gain"]);
        assert_eq!(
            *log.lock(),
            vec![("EXP".to_string(), json!(20)), ("gain".to_string(), json!(2))]
        );
        assert_eq!(device.params(), values(json!({"exposure_time": 20, "gain": 2})));
        assert_eq!(device.cache().value("exposure_time"), Some(&json!(20)));
        assert!(device.cache().to_update().is_empty());

        device.unlink(["exposure_time"]);
        device.apply_values(&values(json!({"exposure_time": 30}))).unwrap();
        assert_eq!(log.lock().last().unwrap().0, "exposure_time");
    }

    #[test]
    fn apply_pending_confirms_only_what_succeeded() {
        let device = Device::new(DeviceProperties::named("cam"));
        device.add_driver(Box::new(SimDriver::new("cam").with_failing_keys(["roi"])));

        device.stage(&values(json!({"exposure": 10, "roi": [0, 0, 4, 4]})));
        let report = device.apply_pending().unwrap();
        assert_eq!(report.applied, vec!["exposure"]);

        let cache = device.cache();
        assert_eq!(cache.value("exposure"), Some(&json!(10)));
        assert_eq!(
            cache.to_update().keys().collect::<Vec<_>>(),
            vec!["roi"]
        );
    }

    #[test]
    fn features_go_through_driver_and_cache() {
        let device = Device::new(DeviceProperties::named("cam"));
        device
            .add_feature(Box::new(Setting::new("exposure").with_force_update(json!(0))))
            .unwrap();
        device
            .add_feature(Box::new(DriverFeature::read_only("temperature")))
            .unwrap();

        // No driver yet.
        assert!(matches!(
            device.get_feature("temperature"),
            Err(ExpError::DriverNotInitialized { .. })
        ));

        device.add_driver(Box::new(
            SimDriver::new("cam").with_value("temperature", json!(-5)),
        ));
        assert_eq!(device.set_feature("exposure", json!(15)).unwrap(), json!(15));
        assert_eq!(device.get_feature("exposure").unwrap(), json!(15));
        assert_eq!(device.get_feature("temperature").unwrap(), json!(-5));
        assert!(device.set_feature("temperature", json!(1)).is_err());
        assert!(device.get_feature("missing").is_err());

        assert_eq!(device.cache().value("temperature"), Some(&json!(-5)));
        let names: Vec<String> = device
            .describe_features()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["exposure", "temperature"]);
    }

    #[test]
    fn properties_parse_from_toml_with_extra_keys() {
        let props: DeviceProperties = toml::from_str(
            r#"
            name = "camera"
            driver = "sim"
            exposure = 20
            [connection]
            type = "serial"
            port = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_eq!(props.name.as_deref(), Some("camera"));
        assert_eq!(
            props.connection,
            Some(Connection::Serial {
                port: "/dev/ttyUSB0".to_string()
            })
        );
        assert_eq!(props.extra.get("exposure"), Some(&json!(20)));
    }
}
