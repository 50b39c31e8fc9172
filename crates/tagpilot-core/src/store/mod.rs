//! Store module
//!
//! DataLayerStore owns this engine's lifecycle contract on the shared data
//! layer global: adopt or create it, append to it, trim it, and restore it.
//! The binding is re-resolved before every write because other code may
//! replace, null or corrupt it at any time.

mod entries;

pub use entries::{
    is_start_marker, start_marker, start_marker_at, trim_entries, START_EVENT,
    START_TIMESTAMP_FIELD,
};

use serde_json::Value;
use std::sync::Arc;

use crate::host::{DataLayerArray, GlobalScope, GlobalValue};

/// How the store's life began.
enum Origin {
    /// An array was already bound; keep it and what it held.
    Existing {
        array: DataLayerArray,
        snapshot: Vec<Value>,
    },
    /// Nothing usable was bound; we created the binding.
    Created,
}

/// Owner-scoped handle on the shared data layer.
pub struct DataLayerStore {
    name: String,
    scope: Arc<dyn GlobalScope>,
    origin: Origin,
}

impl DataLayerStore {
    /// Adopt the array bound at `name`, or create one.
    ///
    /// A non-array binding is ignored and replaced; this never fails.
    pub fn adopt(name: impl Into<String>, scope: Arc<dyn GlobalScope>) -> Self {
        let name = name.into();
        let origin = match scope.get(&name) {
            Some(GlobalValue::Array(array)) => {
                let snapshot = array.snapshot();
                tracing::debug!(data_layer = %name, entries = snapshot.len(), "adopted existing data layer");
                Origin::Existing { array, snapshot }
            }
            other => {
                if let Some(GlobalValue::Value(value)) = &other {
                    tracing::warn!(
                        data_layer = %name,
                        found = %value,
                        "data layer binding is not an array; replacing it"
                    );
                }
                Self::bind_fresh(&name, scope.as_ref());
                Origin::Created
            }
        };
        Self {
            name,
            scope,
            origin,
        }
    }

    fn bind_fresh(name: &str, scope: &dyn GlobalScope) -> DataLayerArray {
        let array = DataLayerArray::new();
        if let Err(err) = scope.set(name, GlobalValue::Array(array.clone())) {
            tracing::warn!(data_layer = %name, error = %err, "failed to bind data layer");
        }
        array
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when an array already existed at adoption time.
    pub fn adopted_existing(&self) -> bool {
        matches!(self.origin, Origin::Existing { .. })
    }

    /// Entries present before adoption (empty when the store created the binding).
    pub fn initial_entries(&self) -> &[Value] {
        match &self.origin {
            Origin::Existing { snapshot, .. } => snapshot,
            Origin::Created => &[],
        }
    }

    /// The array currently bound, recreating it when the binding is unusable.
    pub fn current_array(&self) -> DataLayerArray {
        match self.scope.get(&self.name) {
            Some(GlobalValue::Array(array)) => array,
            other => {
                tracing::warn!(
                    data_layer = %self.name,
                    binding = if other.is_some() { "non-array" } else { "missing" },
                    "data layer binding was replaced externally; recreating"
                );
                Self::bind_fresh(&self.name, self.scope.as_ref())
            }
        }
    }

    /// Append one entry. Write failures are logged, never propagated.
    pub fn push(&self, value: Value) -> bool {
        let array = self.current_array();
        match array.push(value) {
            Ok(_) => true,
            Err(err) => {
                tracing::error!(data_layer = %self.name, error = %err, "failed to push to data layer");
                false
            }
        }
    }

    /// Read the current contents without touching the binding.
    pub fn snapshot(&self) -> Vec<Value> {
        match self.scope.get(&self.name) {
            Some(GlobalValue::Array(array)) => array.snapshot(),
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self.scope.get(&self.name) {
            Some(GlobalValue::Array(array)) => array.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Trim the bound array in place. See [`trim_entries`].
    pub fn trim(&self, max_size: usize) -> usize {
        if max_size == 0 {
            return 0;
        }
        let array = self.current_array();
        let removed = array.edit(|entries| trim_entries(entries, max_size));
        if removed > 0 {
            tracing::debug!(data_layer = %self.name, removed, max_size, "trimmed data layer");
        }
        removed
    }

    /// Put the data layer back the way it was found.
    ///
    /// An adopted array gets its original contents back in place (the host
    /// page may still hold that reference) and is re-bound if something
    /// replaced it. A created binding is deleted; when deletion is refused the
    /// bound array is emptied instead.
    pub fn restore(&self) {
        match &self.origin {
            Origin::Existing { array, snapshot } => {
                array.replace_all(snapshot.clone());
                let still_bound = matches!(
                    self.scope.get(&self.name),
                    Some(GlobalValue::Array(current)) if current.same_array(array)
                );
                if !still_bound {
                    if let Err(err) = self.scope.set(&self.name, GlobalValue::Array(array.clone())) {
                        tracing::warn!(data_layer = %self.name, error = %err, "failed to rebind data layer");
                    }
                }
            }
            Origin::Created => {
                if let Err(err) = self.scope.remove(&self.name) {
                    tracing::warn!(
                        data_layer = %self.name,
                        error = %err,
                        "could not delete data layer binding; emptying it instead"
                    );
                    if let Some(GlobalValue::Array(array)) = self.scope.get(&self.name) {
                        array.truncate(0);
                    }
                }
            }
        }
    }
}
