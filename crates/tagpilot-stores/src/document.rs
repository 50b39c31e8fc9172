//! Document in-memory implementation.
//!
//! Script elements are plain records; tests (or a server-side host) drive
//! them by firing load, error and unload signals explicitly.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tagpilot_core::host::{
    Document, ElementId, ListenerId, ScriptHandlers, ScriptSpec, UnloadListener,
};
use tagpilot_core::{HostError, CONTAINER_MARKER_ATTRIBUTE};

/// Where an element was inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPoint {
    Head,
    Body,
}

/// Read-only view of a script element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRecord {
    pub id: ElementId,
    pub spec: ScriptSpec,
    pub parent: InsertionPoint,
    pub attached: bool,
}

impl ScriptRecord {
    pub fn container_id(&self) -> Option<&str> {
        self.spec.attribute(CONTAINER_MARKER_ATTRIBUTE)
    }
}

struct Element {
    record: ScriptRecord,
    handlers: Option<ScriptHandlers>,
}

struct DocumentState {
    has_head: bool,
    has_body: bool,
    next_id: u64,
    elements: Vec<Element>,
    unload_listeners: BTreeMap<u64, UnloadListener>,
}

/// In-memory document with an optional head and body.
pub struct InMemoryDocument {
    state: RwLock<DocumentState>,
}

impl InMemoryDocument {
    /// Document with both head and body.
    pub fn new() -> Self {
        Self::with_structure(true, true)
    }

    /// Document missing its head (scripts fall back to body).
    pub fn without_head() -> Self {
        Self::with_structure(false, true)
    }

    /// Document with neither head nor body.
    pub fn detached() -> Self {
        Self::with_structure(false, false)
    }

    fn with_structure(has_head: bool, has_body: bool) -> Self {
        Self {
            state: RwLock::new(DocumentState {
                has_head,
                has_body,
                next_id: 1,
                elements: Vec::new(),
                unload_listeners: BTreeMap::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DocumentState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DocumentState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, spec: ScriptSpec, handlers: Option<ScriptHandlers>) -> Result<ElementId, HostError> {
        let mut state = self.write();
        let parent = if state.has_head {
            InsertionPoint::Head
        } else if state.has_body {
            InsertionPoint::Body
        } else {
            return Err(HostError::NoInsertionPoint);
        };
        let id = ElementId(state.next_id);
        state.next_id += 1;
        state.elements.push(Element {
            record: ScriptRecord {
                id,
                spec,
                parent,
                attached: true,
            },
            handlers,
        });
        Ok(id)
    }

    /// Add a script that was already on the page before the engine ran.
    pub fn insert_existing_script(&self, spec: ScriptSpec) -> Result<ElementId, HostError> {
        self.insert(spec, None)
    }

    /// Attached script elements in insertion order.
    pub fn scripts(&self) -> Vec<ScriptRecord> {
        self.read()
            .elements
            .iter()
            .filter(|e| e.record.attached)
            .map(|e| e.record.clone())
            .collect()
    }

    /// Attached script elements carrying the container marker for `container_id`.
    pub fn scripts_for(&self, container_id: &str) -> Vec<ScriptRecord> {
        self.scripts()
            .into_iter()
            .filter(|r| r.container_id() == Some(container_id))
            .collect()
    }

    pub fn element(&self, id: ElementId) -> Option<ScriptRecord> {
        self.read()
            .elements
            .iter()
            .find(|e| e.record.id == id)
            .map(|e| e.record.clone())
    }

    fn handlers(&self, id: ElementId) -> Option<ScriptHandlers> {
        self.read()
            .elements
            .iter()
            .find(|e| e.record.id == id)
            .and_then(|e| e.handlers.clone())
    }

    /// Dispatch a load signal. Returns false if the element has no listeners.
    pub fn fire_load(&self, id: ElementId) -> bool {
        match self.handlers(id) {
            Some(handlers) => {
                (handlers.on_load)();
                true
            }
            None => false,
        }
    }

    /// Dispatch an error signal. Returns false if the element has no listeners.
    pub fn fire_error(&self, id: ElementId, message: impl Into<String>) -> bool {
        match self.handlers(id) {
            Some(handlers) => {
                (handlers.on_error)(message.into());
                true
            }
            None => false,
        }
    }

    /// Dispatch the page unload signal to every registered listener.
    pub fn fire_unload(&self) {
        let listeners: Vec<UnloadListener> =
            self.read().unload_listeners.values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }

    /// Remove an element behind the engine's back.
    pub fn detach(&self, id: ElementId) -> bool {
        self.remove_element(id)
    }

    pub fn unload_listener_count(&self) -> usize {
        self.read().unload_listeners.len()
    }
}

impl Default for InMemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for InMemoryDocument {
    fn find_script(&self, attribute: &str, value: &str) -> Option<ElementId> {
        self.read()
            .elements
            .iter()
            .find(|e| e.record.attached && e.record.spec.attribute(attribute) == Some(value))
            .map(|e| e.record.id)
    }

    fn inject_script(
        &self,
        spec: ScriptSpec,
        handlers: ScriptHandlers,
    ) -> Result<ElementId, HostError> {
        let id = self.insert(spec, Some(handlers))?;
        tracing::trace!(element = %id, "script element inserted");
        Ok(id)
    }

    fn remove_element(&self, element: ElementId) -> bool {
        let mut state = self.write();
        match state
            .elements
            .iter_mut()
            .find(|e| e.record.id == element && e.record.attached)
        {
            Some(e) => {
                e.record.attached = false;
                true
            }
            None => false,
        }
    }

    fn add_unload_listener(&self, listener: UnloadListener) -> ListenerId {
        let mut state = self.write();
        let id = state.next_id;
        state.next_id += 1;
        state.unload_listeners.insert(id, listener);
        ListenerId(id)
    }

    fn remove_unload_listener(&self, listener: ListenerId) {
        self.write().unload_listeners.remove(&listener.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handlers(loads: Arc<AtomicUsize>, errors: Arc<AtomicUsize>) -> ScriptHandlers {
        ScriptHandlers {
            on_load: Arc::new(move || {
                loads.fetch_add(1, Ordering::SeqCst);
            }),
            on_error: Arc::new(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            }),
        }
    }

    #[test]
    fn test_inject_and_dispatch() {
        let doc = InMemoryDocument::new();
        let loads = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let spec = ScriptSpec::new("https://x/gtm.js?id=GTM-ABC123")
            .with_attribute(CONTAINER_MARKER_ATTRIBUTE, "GTM-ABC123");
        let id = doc
            .inject_script(spec, counting_handlers(loads.clone(), errors.clone()))
            .unwrap();

        assert_eq!(doc.find_script(CONTAINER_MARKER_ATTRIBUTE, "GTM-ABC123"), Some(id));
        assert!(doc.fire_load(id));
        assert!(doc.fire_error(id, "net::ERR_FAILED"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(doc.scripts()[0].parent, InsertionPoint::Head);
    }

    #[test]
    fn test_body_fallback_and_missing_insertion_point() {
        let doc = InMemoryDocument::without_head();
        let id = doc.insert_existing_script(ScriptSpec::new("a.js")).unwrap();
        assert_eq!(doc.element(id).unwrap().parent, InsertionPoint::Body);

        let bare = InMemoryDocument::detached();
        assert_eq!(
            bare.insert_existing_script(ScriptSpec::new("a.js")),
            Err(HostError::NoInsertionPoint)
        );
    }

    #[test]
    fn test_remove_tolerates_detached_elements() {
        let doc = InMemoryDocument::new();
        let id = doc.insert_existing_script(ScriptSpec::new("a.js")).unwrap();
        assert!(doc.detach(id));
        assert!(!doc.remove_element(id));
        assert!(doc.scripts().is_empty());
    }

    #[test]
    fn test_unload_listeners() {
        let doc = InMemoryDocument::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let listener = doc.add_unload_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        doc.fire_unload();
        doc.remove_unload_listener(listener);
        doc.fire_unload();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(doc.unload_listener_count(), 0);
    }
}
