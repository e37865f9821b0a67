//! `experimentor-runtime` – experiment orchestration on top of the relay and
//! the device layer.
//!
//! # Modules
//!
//! - [`model`] – [`ModelRegistry`]: live model instances and the
//!   [`ModelHandle`]s that make signal topics unique.
//! - [`signal`] – [`Signal`] and [`SignalSet`]: named model events carried
//!   over the relay, with lazily opened pushers.
//! - [`experiment`] – [`Experiment`]: loads devices from an experiment file,
//!   starts the relay, initialises drivers and wires up consumers.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod experiment;
pub mod model;
pub mod signal;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use experiment::{Experiment, ExperimentConfig, InitReport};
pub use model::{ModelEntry, ModelHandle, ModelRegistry};
pub use signal::{Signal, SignalArgs, SignalSet};
