//! Host boundary.
//!
//! The engine never owns the page. It reads and writes globals through
//! [`GlobalScope`] and manipulates script elements through [`Document`].
//! Both may be mutated by unrelated code between any two calls.
//!
//! Note: in-memory implementations are in the tagpilot-stores crate

mod array;

pub use array::{DataLayerArray, PushInterceptor};

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::HostError;

/// Value bound to a global name.
#[derive(Debug, Clone)]
pub enum GlobalValue {
    /// An array-shaped binding (the only shape usable as a data layer).
    Array(DataLayerArray),
    /// Anything else, including `null`.
    Value(Value),
}

impl GlobalValue {
    pub fn as_array(&self) -> Option<&DataLayerArray> {
        match self {
            GlobalValue::Array(array) => Some(array),
            GlobalValue::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            GlobalValue::Array(_) => None,
            GlobalValue::Value(value) => Some(value),
        }
    }
}

/// Process-wide global bindings.
pub trait GlobalScope: Send + Sync {
    fn get(&self, name: &str) -> Option<GlobalValue>;

    fn set(&self, name: &str, value: GlobalValue) -> Result<(), HostError>;

    /// Delete a binding. Fails for non-configurable bindings.
    fn remove(&self, name: &str) -> Result<(), HostError>;
}

/// Opaque handle to an element created by the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

/// Opaque handle to a registered unload listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Script element to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSpec {
    pub src: String,
    pub is_async: bool,
    pub attributes: Vec<(String, String)>,
}

impl ScriptSpec {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            is_async: true,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub type LoadHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(String) + Send + Sync>;
pub type UnloadListener = Arc<dyn Fn() + Send + Sync>;

/// Listeners attached to a script element at insertion time.
#[derive(Clone)]
pub struct ScriptHandlers {
    pub on_load: LoadHandler,
    pub on_error: ErrorHandler,
}

impl fmt::Debug for ScriptHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandlers").finish_non_exhaustive()
    }
}

/// The page document, as far as script injection is concerned.
///
/// Load and error signals are delivered synchronously through the
/// [`ScriptHandlers`] given to [`Document::inject_script`].
pub trait Document: Send + Sync {
    /// First attached script element whose `attribute` equals `value`.
    fn find_script(&self, attribute: &str, value: &str) -> Option<ElementId>;

    /// Insert into head, falling back to body.
    fn inject_script(&self, spec: ScriptSpec, handlers: ScriptHandlers)
        -> Result<ElementId, HostError>;

    /// Detach an element. Returns false when it was already detached.
    fn remove_element(&self, element: ElementId) -> bool;

    fn add_unload_listener(&self, listener: UnloadListener) -> ListenerId;

    fn remove_unload_listener(&self, listener: ListenerId);
}
