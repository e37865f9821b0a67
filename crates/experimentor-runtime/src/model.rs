//! Registry of live model instances.
//!
//! Every experiment, device wrapper or other model that owns signals gets a
//! [`ModelHandle`] here.  Handles come from a counter that never goes back,
//! so a topic built from a handle is never reused within a process, even
//! after the model is gone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use experimentor_types::ExpError;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelHandle(u64);

impl ModelHandle {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    /// Model type, e.g. `"experiment"` or `"camera"`.
    pub kind: String,
    pub name: String,
}

#[derive(Debug)]
pub struct ModelRegistry {
    next: AtomicU64,
    instances: RwLock<IndexMap<ModelHandle, ModelEntry>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            // 0 is left free so a handle is never mistaken for "no owner".
            next: AtomicU64::new(1),
            instances: RwLock::new(IndexMap::new()),
        }
    }

    pub fn register(&self, kind: impl Into<String>, name: impl Into<String>) -> ModelHandle {
        let handle = ModelHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let entry = ModelEntry {
            kind: kind.into(),
            name: name.into(),
        };
        debug!(handle = %handle, kind = %entry.kind, name = %entry.name, "model registered");
        self.instances.write().insert(handle, entry);
        handle
    }

    /// # Errors
    ///
    /// [`ExpError::InvalidModel`] if `handle` is not registered.
    pub fn unregister(&self, handle: ModelHandle) -> Result<ModelEntry, ExpError> {
        match self.instances.write().shift_remove(&handle) {
            Some(entry) => {
                debug!(handle = %handle, kind = %entry.kind, "model unregistered");
                Ok(entry)
            }
            None => Err(ExpError::InvalidModel(format!(
                "model {handle} is not registered"
            ))),
        }
    }

    pub fn get(&self, handle: ModelHandle) -> Option<ModelEntry> {
        self.instances.read().get(&handle).cloned()
    }

    /// Live instances of `kind`, oldest first.
    pub fn instances_of(&self, kind: &str) -> Vec<(ModelHandle, String)> {
        self.instances
            .read()
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(h, e)| (*h, e.name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}
