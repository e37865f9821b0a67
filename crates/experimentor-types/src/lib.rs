//! `experimentor-types` – shared data model for the Experimentor workspace.
//!
//! Every other crate speaks in terms of the types defined here:
//!
//! - [`array`] – [`NdArray`], a dtype-tagged numeric buffer that can be
//!   rebuilt on the receiving side without losing element type or shape.
//! - [`payload`] – [`Payload`] and the [`Metadata`] record that travels next
//!   to it so a receiver knows how to decode the bytes.
//! - [`config`] – [`RelayConfig`], the one configuration struct handed to the
//!   relay, pushers, subscribers and signals.
//!
//! [`ExpError`] is the workspace-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod array;
pub mod config;
pub mod payload;

pub use array::{DType, Element, NdArray};
pub use config::RelayConfig;
pub use payload::{Metadata, Payload};

/// Global error type spanning transport failures, codec problems, driver
/// faults and model misuse.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExpError {
    #[error("Bind error on {addr}: {details}")]
    Bind { addr: String, details: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("Driver of {device} is not initialized")]
    DriverNotInitialized { device: String },

    #[error("Driver initialization failed for {device}: {details}")]
    DriverInit { device: String, details: String },

    #[error("Unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("{name}: value {value} outside limits [{min}, {max}]")]
    OutOfLimits {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Property error on {name}: {details}")]
    Property { name: String, details: String },

    #[error("Callback on topic '{topic}' failed: {details}")]
    Callback { topic: String, details: String },
}

impl From<serde_json::Error> for ExpError {
    fn from(e: serde_json::Error) -> Self {
        ExpError::Serialization(e.to_string())
    }
}
