//! [`Properties`] – a per-model cache of parameter values.
//!
//! Each entry remembers three things: the value someone asked for
//! (`new_value`), the value known to be on the instrument (`value`) and the
//! one before it (`old_value`).  `to_update` is raised whenever a new value
//! is staged and lowered once the instrument confirms it, so a model can push
//! only what changed.
//!
//! Properties can also be linked to the driver method that applies them.

use experimentor_types::ExpError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyEntry {
    pub new_value: Value,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub to_update: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    entries: IndexMap<String, PropertyEntry>,
    links: IndexMap<String, Option<String>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every key of `map` staged as a new value.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let mut props = Self::new();
        props.update(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        props
    }

    /// Stage `value` for `key`.  Unknown keys are added.
    pub fn stage(&mut self, key: impl Into<String>, value: Value) {
        self.entries
            .entry(key.into())
            .and_modify(|e| {
                e.new_value = value.clone();
                e.to_update = true;
            })
            .or_insert(PropertyEntry {
                new_value: value,
                value: None,
                old_value: None,
                to_update: true,
            });
    }

    /// Stage several values at once, like `HashMap::extend` but without
    /// touching the confirmed values.
    pub fn update<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (key, value) in values {
            self.stage(key, value);
        }
    }

    /// Record values read back from the instrument.
    ///
    /// # Errors
    ///
    /// [`ExpError::Property`] if a key was never listed; nothing is changed
    /// in that case.
    pub fn upgrade<'a, I>(&mut self, values: I) -> Result<(), ExpError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let values: Vec<(&str, Value)> = values.into_iter().collect();
        if let Some((missing, _)) = values.iter().find(|(k, _)| !self.entries.contains_key(*k)) {
            return Err(ExpError::Property {
                name: missing.to_string(),
                details: "not a listed property".to_string(),
            });
        }
        for (key, value) in values {
            self.record(key, value);
        }
        Ok(())
    }

    /// Record a confirmed value, listing the key if needed.
    pub fn record(&mut self, key: &str, value: Value) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.old_value = entry.value.replace(value.clone());
                entry.new_value = value;
                entry.to_update = false;
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    PropertyEntry {
                        new_value: value.clone(),
                        value: Some(value),
                        old_value: None,
                        to_update: false,
                    },
                );
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&PropertyEntry> {
        self.entries.get(key)
    }

    /// Confirmed value of `key`, if any.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Staged values still waiting for the instrument, in listing order.
    pub fn to_update(&self) -> Map<String, Value> {
        self.entries
            .iter()
            .filter(|(_, e)| e.to_update)
            .map(|(k, e)| (k.clone(), e.new_value.clone()))
            .collect()
    }

    /// Link properties to the methods that apply them.
    ///
    /// # Errors
    ///
    /// [`ExpError::Property`] if one of them is already linked; unlink first.
    pub fn link<I, K, M>(&mut self, links: I) -> Result<(), ExpError>
    where
        I: IntoIterator<Item = (K, M)>,
        K: Into<String>,
        M: Into<String>,
    {
        for (key, method) in links {
            let key = key.into();
            if let Some(Some(existing)) = self.links.get(&key) {
                return Err(ExpError::Property {
                    name: key,
                    details: format!("already linked to '{existing}', unlink first"),
                });
            }
            self.links.insert(key, Some(method.into()));
        }
        Ok(())
    }

    pub fn unlink<I, K>(&mut self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            match self.links.get_mut(key) {
                Some(slot) => *slot = None,
                None => warn!(property = key, "unlinking a property that was never linked"),
            }
        }
    }

    /// Method linked to `key`.
    pub fn linked(&self, key: &str) -> Option<&str> {
        self.links.get(key).and_then(|m| m.as_deref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn staged_values_wait_for_upgrade() {
        let mut props = Properties::new();
        props.update([("exposure", json!(10)), ("gain", json!(1))]);
        assert_eq!(props.value("exposure"), None);
        assert_eq!(props.to_update().len(), 2);

        props.upgrade([("exposure", json!(12))]).unwrap();
        let entry = props.get("exposure").unwrap();
        assert_eq!(entry.value, Some(json!(12)));
        assert_eq!(entry.new_value, json!(12));
        assert!(!entry.to_update);

        let pending = props.to_update();
        assert_eq!(pending.keys().collect::<Vec<_>>(), vec!["gain"]);
    }

    #[test]
    fn restaging_keeps_confirmed_value() {
        let mut props = Properties::new();
        props.record("exposure", json!(5));
        props.stage("exposure", json!(7));
        let entry = props.get("exposure").unwrap();
        assert_eq!(entry.value, Some(json!(5)));
        assert_eq!(entry.new_value, json!(7));
        assert!(entry.to_update);

        props.record("exposure", json!(7));
        assert_eq!(props.get("exposure").unwrap().old_value, Some(json!(5)));
    }

    #[test]
    fn upgrade_of_unknown_key_changes_nothing() {
        let mut props = Properties::new();
        props.stage("roi", json!([0, 0, 16, 16]));
        let err = props
            .upgrade([("roi", json!([0, 0, 8, 8])), ("binning", json!(2))])
            .unwrap_err();
        assert!(matches!(err, ExpError::Property { name, .. } if name == "binning"));
        assert_eq!(props.value("roi"), None);
    }

    #[test]
    fn double_link_requires_unlink() {
        let mut props = Properties::new();
        props.link([("exposure_time", "exposure")]).unwrap();
        assert!(props.link([("exposure_time", "set_exposure")]).is_err());
        assert_eq!(props.linked("exposure_time"), Some("exposure"));

        props.unlink(["exposure_time", "never_linked"]);
        assert_eq!(props.linked("exposure_time"), None);
        props.link([("exposure_time", "set_exposure")]).unwrap();
        assert_eq!(props.linked("exposure_time"), Some("set_exposure"));
    }

    #[test]
    fn from_map_keeps_order() {
        let map = json!({"b": 1, "a": 2}).as_object().cloned().unwrap();
        let props = Properties::from_map(&map);
        assert_eq!(props.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }
}
