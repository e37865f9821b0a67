//! [`SimDriver`] – a driver that talks to no hardware.
//!
//! It stores whatever is written to it and hands it back on read, so a full
//! experiment can run in tests and dry runs.  Individual keys can be marked
//! as failing to exercise error paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use experimentor_types::ExpError;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::driver::Driver;

/// Every successful write, in order.  Shared so a test can keep a handle
/// after the driver has been boxed and handed to a device.
pub type WriteLog = Arc<Mutex<Vec<(String, Value)>>>;

pub struct SimDriver {
    id: String,
    values: HashMap<String, Value>,
    failing: HashSet<String>,
    writes: WriteLog,
}

impl SimDriver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: HashMap::new(),
            failing: HashSet::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reads and writes of these keys fail with a hardware fault.
    pub fn with_failing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Preload a value, as if the instrument powered up with it.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn write_log(&self) -> WriteLog {
        Arc::clone(&self.writes)
    }

    fn check(&self, key: &str) -> Result<(), ExpError> {
        if self.failing.contains(key) {
            return Err(ExpError::HardwareFault {
                component: self.id.clone(),
                details: format!("'{key}' rejected by simulated instrument"),
            });
        }
        Ok(())
    }
}

impl Driver for SimDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), ExpError> {
        self.check(key)?;
        debug!(driver = %self.id, key, %value, "sim set");
        self.values.insert(key.to_string(), value.clone());
        self.writes.lock().push((key.to_string(), value.clone()));
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Value, ExpError> {
        self.check(key)?;
        Ok(self.values.get(key).cloned().unwrap_or(Value::Null))
    }
}
