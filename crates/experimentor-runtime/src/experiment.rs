//! [`Experiment`] – ties devices and messaging together.
//!
//! A typical run:
//!
//! 1. [`Experiment::from_config`] with an experiment file (`[relay]` plus
//!    `[[devices]]`),
//! 2. [`start`](Experiment::start) the relay and the experiment's pusher,
//! 3. [`initialize_devices`](Experiment::initialize_devices),
//! 4. [`connect`](Experiment::connect) consumers and
//!    [`publish`](Experiment::publish) data,
//! 5. [`finalize`](Experiment::finalize).

use std::path::Path;
use std::sync::Arc;

use experimentor_hal::{Device, DeviceProperties, DriverRegistry};
use experimentor_middleware::{
    Publisher, Pusher, RelayAddrs, RelayContext, RelayStats, StopFlag, Subscriber,
};
use experimentor_types::{ExpError, Payload, RelayConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::model::{ModelHandle, ModelRegistry};

/// Contents of an experiment file.
///
/// ```toml
/// [relay]
/// fanin_port = 5557
/// grace_period = "500ms"
///
/// [[devices]]
/// name = "stage"
/// driver = "sim"
/// connection = { type = "sim" }
///
/// [devices.defaults]
/// x = 0.0
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub devices: Vec<DeviceProperties>,
}

impl ExperimentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ExpError> {
        toml::from_str(text).map_err(|e| ExpError::InvalidConfig(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ExpError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ExpError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

/// Outcome of [`Experiment::initialize_devices`].
#[derive(Debug, Default, PartialEq)]
pub struct InitReport {
    pub initialized: Vec<String>,
    /// Devices with no driver configured.
    pub without_driver: Vec<String>,
    pub failed: Vec<(String, ExpError)>,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Link {
    name: String,
    subscriber: Subscriber,
}

pub struct Experiment {
    name: String,
    handle: ModelHandle,
    models: Arc<ModelRegistry>,
    drivers: DriverRegistry,
    publisher: Publisher,
    pusher: Option<Pusher>,
    devices: IndexMap<String, Arc<Device>>,
    links: Vec<Link>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        ctx: RelayContext,
        drivers: DriverRegistry,
        models: Arc<ModelRegistry>,
    ) -> Self {
        let name = name.into();
        let handle = models.register("experiment", name.clone());
        info!(experiment = %name, handle = %handle, "creating experiment");
        Self {
            name,
            handle,
            models,
            drivers,
            publisher: Publisher::new(ctx),
            pusher: None,
            devices: IndexMap::new(),
            links: Vec::new(),
        }
    }

    /// Build an experiment from a parsed experiment file.
    pub fn from_config(
        name: impl Into<String>,
        config: ExperimentConfig,
        stop: StopFlag,
        drivers: DriverRegistry,
        models: Arc<ModelRegistry>,
    ) -> Result<Self, ExpError> {
        let ctx = RelayContext::with_stop(config.relay, stop);
        let mut experiment = Self::new(name, ctx, drivers, models);
        experiment.load_devices(config.devices)?;
        Ok(experiment)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ModelHandle {
        self.handle
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    /// Add devices.  Nothing is added if one of them has no name or reuses
    /// an existing name.
    pub fn load_devices<I>(&mut self, devices: I) -> Result<usize, ExpError>
    where
        I: IntoIterator<Item = DeviceProperties>,
    {
        let mut staged: IndexMap<String, DeviceProperties> = IndexMap::new();
        for props in devices {
            let Some(name) = props.name.clone() else {
                return Err(ExpError::InvalidModel(
                    "every device of an experiment needs a name".to_string(),
                ));
            };
            if self.devices.contains_key(&name) || staged.contains_key(&name) {
                warn!(experiment = %self.name, device = %name, "trying to load a duplicated device");
                return Err(ExpError::InvalidModel(format!("device '{name}' loaded twice")));
            }
            staged.insert(name, props);
        }
        let count = staged.len();
        for (name, props) in staged {
            debug!(experiment = %self.name, device = %name, "added device");
            self.devices.insert(name, Arc::new(Device::new(props)));
        }
        Ok(count)
    }

    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.get(name)
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    /// Build every configured driver and apply each device's `defaults`
    /// table.  A device that fails is reported and the rest carry on.
    pub fn initialize_devices(&self) -> InitReport {
        let mut report = InitReport::default();
        for (name, device) in &self.devices {
            if let Err(e) = device.initialize_driver(&self.drivers) {
                report.failed.push((name.clone(), e));
                continue;
            }
            if !device.has_driver() {
                report.without_driver.push(name.clone());
                continue;
            }
            if let Some(Value::Object(defaults)) = device.properties().extra.get("defaults") {
                match device.apply_values(defaults) {
                    Ok(applied) if !applied.is_complete() => {
                        warn!(device = %name, failed = applied.failed.len(), "some defaults were rejected");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(device = %name, error = %e, "could not apply defaults"),
                }
            }
            report.initialized.push(name.clone());
        }
        info!(
            experiment = %self.name,
            initialized = report.initialized.len(),
            failed = report.failed.len(),
            "devices initialized"
        );
        report
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Start the relay and open the experiment's own pusher.
    pub async fn start(&mut self) -> Result<RelayAddrs, ExpError> {
        let addrs = self.publisher.start().await?;
        let pusher = Pusher::connect(self.client_context()?).await?;
        self.pusher = Some(pusher);
        info!(experiment = %self.name, fanin = %addrs.fanin, fanout = %addrs.fanout, "experiment started");
        Ok(addrs)
    }

    /// Context for clients of this experiment's relay.
    pub fn client_context(&self) -> Result<RelayContext, ExpError> {
        self.publisher
            .client_context()
            .ok_or_else(|| ExpError::NotRunning(format!("relay of experiment {}", self.name)))
    }

    pub fn is_running(&self) -> bool {
        self.publisher.is_running()
    }

    /// Run `callback` for every payload on `topic`; `name` identifies the
    /// connection in [`connections`](Self::connections).
    pub async fn connect<F>(
        &mut self,
        name: impl Into<String>,
        topic: impl Into<String>,
        callback: F,
    ) -> Result<(), ExpError>
    where
        F: FnMut(Payload) -> Result<(), ExpError> + Send + 'static,
    {
        let name = name.into();
        let subscriber = Subscriber::start(self.client_context()?, topic, callback).await?;
        info!(experiment = %self.name, connection = %name, topic = %subscriber.topic(), "connected");
        self.links.push(Link { name, subscriber });
        Ok(())
    }

    /// `(name, topic)` of every connection, in connection order.
    pub fn connections(&self) -> Vec<(&str, &str)> {
        self.links
            .iter()
            .map(|l| (l.name.as_str(), l.subscriber.topic()))
            .collect()
    }

    pub async fn publish(&self, payload: impl Into<Payload>, topic: &str) -> Result<(), ExpError> {
        let Some(pusher) = &self.pusher else {
            return Err(ExpError::NotRunning(format!("experiment {}", self.name)));
        };
        pusher.publish(payload, topic).await
    }

    /// Stop every connection, then the relay.
    ///
    /// Connections are stopped one by one without sending anything over the
    /// relay, so consumers started elsewhere on the same topics keep running.
    /// Callback errors are logged.  Finally the relay receives its own exit
    /// sentinel.
    pub async fn finalize(&mut self) -> Result<RelayStats, ExpError> {
        info!(experiment = %self.name, connections = self.links.len(), "finalizing");
        for mut link in self.links.drain(..) {
            match link.subscriber.stop().await {
                Ok(stats) => {
                    debug!(connection = %link.name, delivered = stats.delivered, "connection closed")
                }
                Err(e) => {
                    error!(connection = %link.name, error = %e, "connection ended with an error")
                }
            }
        }
        if let Some(pusher) = self.pusher.take() {
            pusher.finish().await;
        }

        let stats = self.publisher.stop().await?;
        if let Err(e) = self.models.unregister(self.handle) {
            debug!(error = %e, "experiment already unregistered");
        }
        info!(experiment = %self.name, relayed = stats.relayed, "experiment finalized");
        Ok(stats)
    }
}
