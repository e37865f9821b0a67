//! Named parameters of a device.
//!
//! A [`Feature`] is a parameter that can be read, written or both.  Two
//! flavours exist:
//!
//! - [`DriverFeature`] goes to the instrument on every read.  Use it for
//!   values that change by themselves (a temperature, an analog input).
//! - [`Setting`] caches the last known value and only asks the instrument
//!   again when its *force-update* value is written.  Use it for values that
//!   change only when told to (an exposure time).
//!
//! Features are kept per device in an ordered [`FeatureMap`].

use experimentor_types::ExpError;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Feature,
    Setting,
}

/// What a UI or a log needs to know about a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FeatureInfo {
    pub name: String,
    pub kind: FeatureKind,
    pub readable: bool,
    pub writable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

pub trait Feature: Send {
    fn name(&self) -> &str;

    /// Current value.
    fn get(&mut self, driver: &mut dyn Driver) -> Result<Value, ExpError>;

    /// Write `value`; returns the value now in effect.
    fn set(&mut self, driver: &mut dyn Driver, value: Value) -> Result<Value, ExpError>;

    fn describe(&self) -> FeatureInfo;
}

fn denied(name: &str, what: &str) -> ExpError {
    ExpError::Property {
        name: name.to_string(),
        details: what.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Live feature
// ─────────────────────────────────────────────────────────────────────────────

/// A parameter read from and written to the driver every time.
#[derive(Debug, Clone)]
pub struct DriverFeature {
    name: String,
    key: String,
    readable: bool,
    writable: bool,
    doc: Option<String>,
}

impl DriverFeature {
    /// Readable and writable; the driver key is the feature name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            readable: true,
            writable: true,
            doc: None,
        }
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            writable: false,
            ..Self::new(name)
        }
    }

    pub fn write_only(name: impl Into<String>) -> Self {
        Self {
            readable: false,
            ..Self::new(name)
        }
    }

    /// Use a different driver key than the feature name.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

impl Feature for DriverFeature {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self, driver: &mut dyn Driver) -> Result<Value, ExpError> {
        if !self.readable {
            return Err(denied(&self.name, "unreadable feature"));
        }
        driver.get(&self.key)
    }

    fn set(&mut self, driver: &mut dyn Driver, value: Value) -> Result<Value, ExpError> {
        if !self.writable {
            return Err(denied(&self.name, "read-only feature"));
        }
        driver.set(&self.key, &value)?;
        Ok(value)
    }

    fn describe(&self) -> FeatureInfo {
        FeatureInfo {
            name: self.name.clone(),
            kind: FeatureKind::Feature,
            readable: self.readable,
            writable: self.writable,
            doc: self.doc.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cached setting
// ─────────────────────────────────────────────────────────────────────────────

/// A parameter served from cache.
///
/// The first read fills the cache from the driver.  Writing the force-update
/// value (default `null`) refreshes the cache from the driver instead of
/// writing anything.  Any other write goes to the driver and the cache is
/// refreshed by reading back, so it holds what the instrument accepted.
#[derive(Debug, Clone)]
pub struct Setting {
    name: String,
    key: String,
    writable: bool,
    force_update: Value,
    cached: Option<Value>,
    doc: Option<String>,
}

impl Setting {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            writable: true,
            force_update: Value::Null,
            cached: None,
            doc: None,
        }
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            writable: false,
            ..Self::new(name)
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Value that, when written, triggers a refresh from the driver.
    pub fn with_force_update(mut self, value: Value) -> Self {
        self.force_update = value;
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn cached(&self) -> Option<&Value> {
        self.cached.as_ref()
    }

    fn refresh(&mut self, driver: &mut dyn Driver) -> Result<Value, ExpError> {
        let value = driver.get(&self.key)?;
        self.cached = Some(value.clone());
        Ok(value)
    }
}

impl Feature for Setting {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self, driver: &mut dyn Driver) -> Result<Value, ExpError> {
        match &self.cached {
            Some(value) => Ok(value.clone()),
            None => self.refresh(driver),
        }
    }

    fn set(&mut self, driver: &mut dyn Driver, value: Value) -> Result<Value, ExpError> {
        if value == self.force_update {
            return self.refresh(driver);
        }
        if !self.writable {
            return Err(denied(
                &self.name,
                &format!("read-only setting; write {} to refresh it", self.force_update),
            ));
        }
        driver.set(&self.key, &value)?;
        self.refresh(driver)
    }

    fn describe(&self) -> FeatureInfo {
        FeatureInfo {
            name: self.name.clone(),
            kind: FeatureKind::Setting,
            readable: true,
            writable: self.writable,
            doc: self.doc.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-device map
// ─────────────────────────────────────────────────────────────────────────────

/// Features of one device, in declaration order.
#[derive(Default)]
pub struct FeatureMap {
    features: IndexMap<String, Box<dyn Feature>>,
}

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// [`ExpError::Property`] if a feature with the same name exists.
    pub fn insert(&mut self, feature: Box<dyn Feature>) -> Result<(), ExpError> {
        let name = feature.name().to_string();
        if self.features.contains_key(&name) {
            return Err(denied(&name, "feature declared twice"));
        }
        self.features.insert(name, feature);
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Feature>> {
        self.features.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn describe(&self) -> Vec<FeatureInfo> {
        self.features.values().map(|f| f.describe()).collect()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
