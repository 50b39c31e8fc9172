//! GlobalScope in-memory implementation.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tagpilot_core::host::{DataLayerArray, GlobalScope, GlobalValue};
use tagpilot_core::{HostError, VENDOR_RUNTIME_GLOBAL};

/// In-memory global bindings, standing in for `window`.
#[derive(Default)]
pub struct InMemoryWindow {
    bindings: RwLock<HashMap<String, GlobalValue>>,
    non_configurable: RwLock<HashSet<String>>,
}

impl InMemoryWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh array holding `entries` and return a handle to it.
    pub fn set_array(&self, name: &str, entries: Vec<Value>) -> DataLayerArray {
        let array = DataLayerArray::from_entries(entries);
        self.write_binding(name, GlobalValue::Array(array.clone()));
        array
    }

    /// Bind a non-array value (including `null`).
    pub fn set_value(&self, name: &str, value: Value) {
        self.write_binding(name, GlobalValue::Value(value));
    }

    pub fn array(&self, name: &str) -> Option<DataLayerArray> {
        self.get(name).and_then(|v| v.as_array().cloned())
    }

    /// Entries of the array bound at `name`; `None` if absent or not an array.
    pub fn entries(&self, name: &str) -> Option<Vec<Value>> {
        self.array(name).map(|array| array.snapshot())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read_bindings().contains_key(name)
    }

    /// Make `remove` fail for `name`, like a non-configurable property.
    pub fn mark_non_configurable(&self, name: &str) {
        self.non_configurable
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
    }

    /// Simulate the vendor runtime registering a container.
    pub fn register_vendor_container(&self, container_id: &str) {
        let mut bindings = self
            .bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut registry = match bindings.get(VENDOR_RUNTIME_GLOBAL) {
            Some(GlobalValue::Value(Value::Object(map))) => map.clone(),
            _ => Map::new(),
        };
        registry.insert(container_id.to_string(), Value::Object(Map::new()));
        bindings.insert(
            VENDOR_RUNTIME_GLOBAL.to_string(),
            GlobalValue::Value(Value::Object(registry)),
        );
    }

    fn read_bindings(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, GlobalValue>> {
        self.bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_binding(&self, name: &str, value: GlobalValue) {
        self.bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), value);
    }
}

impl GlobalScope for InMemoryWindow {
    fn get(&self, name: &str) -> Option<GlobalValue> {
        self.read_bindings().get(name).cloned()
    }

    fn set(&self, name: &str, value: GlobalValue) -> Result<(), HostError> {
        self.write_binding(name, value);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), HostError> {
        let locked = self
            .non_configurable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name);
        if locked {
            return Err(HostError::NotConfigurable(name.to_string()));
        }
        self.bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
        Ok(())
    }
}
