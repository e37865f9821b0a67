//! `experimentor-hal` – the device layer.
//!
//! A [`Device`] owns one instrument driver and mediates every value that goes
//! to or comes from it.  [`Actuator`]s and [`Sensor`]s are named channels
//! attached to a device; [`Feature`]s expose driver parameters by name; the
//! [`Properties`] cache tracks which values are staged and which are known to
//! be on the hardware.
//!
//! # Modules
//!
//! - [`action`] – [`ActionMap`]: named one-shot operations run on worker
//!   threads, serialised by a per-model lock.
//! - [`driver`] – the [`Driver`] trait, [`Connection`] kinds and the
//!   [`DriverRegistry`] that turns a driver key into a live driver.
//! - [`device`] – [`Device`] and its [`DeviceProperties`].
//! - [`actuator`] / [`sensor`] – channels with limits and a device handle.
//! - [`feature`] – live [`DriverFeature`]s and cached [`Setting`]s.
//! - [`properties`] – staged/real value cache with property→method links,
//!   which [`Device`] follows when it writes to the driver.
//! - [`sim`] – an in-process [`SimDriver`] for tests and dry runs.

pub mod action;
pub mod actuator;
pub mod device;
pub mod driver;
pub mod feature;
pub mod properties;
pub mod sensor;
pub mod sim;

pub use action::{ActionFn, ActionLock, ActionMap, ActionThread};
pub use actuator::{Actuator, Limits};
pub use device::{ApplyReport, Device, DeviceProperties};
pub use driver::{Connection, Driver, DriverRegistry};
pub use feature::{DriverFeature, Feature, FeatureInfo, FeatureKind, FeatureMap, Setting};
pub use properties::{Properties, PropertyEntry};
pub use sensor::Sensor;
pub use sim::SimDriver;
