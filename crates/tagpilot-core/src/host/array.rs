//! Shared data layer array.

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::HostError;

/// Replacement for the array's append operation, as installed by third-party
/// code that monkey-patches `push`. Returning `Err` rejects the write.
pub type PushInterceptor = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

struct ArrayInner {
    entries: RwLock<Vec<Value>>,
    interceptor: RwLock<Option<PushInterceptor>>,
}

/// Handle to a shared append-only array.
///
/// Clones share the same storage, the way several scripts can hold the same
/// array reference. Use [`DataLayerArray::same_array`] to compare identity.
#[derive(Clone)]
pub struct DataLayerArray {
    inner: Arc<ArrayInner>,
}

impl DataLayerArray {
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    pub fn from_entries(entries: Vec<Value>) -> Self {
        Self {
            inner: Arc::new(ArrayInner {
                entries: RwLock::new(entries),
                interceptor: RwLock::new(None),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Value>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Value>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one entry, honoring any installed interceptor.
    pub fn push(&self, value: Value) -> Result<usize, HostError> {
        let interceptor = self
            .inner
            .interceptor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(interceptor) = interceptor {
            interceptor(&value).map_err(HostError::PushRejected)?;
        }
        let mut entries = self.write();
        entries.push(value);
        Ok(entries.len())
    }

    /// Install (or clear, with `None`) a push interceptor.
    pub fn set_push_interceptor(&self, interceptor: Option<PushInterceptor>) {
        *self
            .inner
            .interceptor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = interceptor;
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.read().get(index).cloned()
    }

    /// Replace all entries in place; the array identity is unchanged.
    pub fn replace_all(&self, entries: Vec<Value>) {
        *self.write() = entries;
    }

    pub fn truncate(&self, len: usize) {
        self.write().truncate(len);
    }

    /// Mutate the entries under a single lock.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        f(&mut self.write())
    }

    pub fn same_array(&self, other: &DataLayerArray) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for DataLayerArray {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataLayerArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataLayerArray")
            .field("len", &self.len())
            .finish()
    }
}
