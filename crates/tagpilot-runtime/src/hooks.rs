//! Script lifecycle hooks.
//!
//! Hooks observe terminal transitions of the script state machine. A hook
//! that returns `Err` or panics is logged and skipped; it never disturbs the
//! state machine or other hooks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tagpilot_core::ScriptLoadState;

/// Script lifecycle extension point.
pub trait ScriptHook: Send + Sync {
    fn on_script_loaded(&self, _state: &ScriptLoadState) -> Result<(), String> {
        Ok(())
    }

    /// A container exhausted its retries.
    fn on_script_error(&self, _state: &ScriptLoadState) -> Result<(), String> {
        Ok(())
    }

    /// A script loaded but the vendor runtime never registered its container.
    fn on_partial_load(&self, _state: &ScriptLoadState) -> Result<(), String> {
        Ok(())
    }
}

/// Registry for script hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ScriptHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn ScriptHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ScriptHook>> {
        self.hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn on_script_loaded(&self, state: &ScriptLoadState) {
        for hook in self.snapshot() {
            invoke("on_script_loaded", state, || hook.on_script_loaded(state));
        }
    }

    pub fn on_script_error(&self, state: &ScriptLoadState) {
        for hook in self.snapshot() {
            invoke("on_script_error", state, || hook.on_script_error(state));
        }
    }

    pub fn on_partial_load(&self, state: &ScriptLoadState) {
        for hook in self.snapshot() {
            invoke("on_partial_load", state, || hook.on_partial_load(state));
        }
    }
}

fn invoke(phase: &str, state: &ScriptLoadState, call: impl FnOnce() -> Result<(), String>) {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(error = %err, phase, container_id = %state.container_id, "script hook failed");
        }
        Err(_) => {
            tracing::warn!(phase, container_id = %state.container_id, "script hook panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tagpilot_core::ScriptStatus;

    struct Failing;

    impl ScriptHook for Failing {
        fn on_script_error(&self, _state: &ScriptLoadState) -> Result<(), String> {
            Err("nope".to_string())
        }

        fn on_partial_load(&self, _state: &ScriptLoadState) -> Result<(), String> {
            panic!("hook exploded");
        }
    }

    #[derive(Default)]
    struct Counting {
        errors: AtomicUsize,
        partials: AtomicUsize,
    }

    impl ScriptHook for Counting {
        fn on_script_error(&self, _state: &ScriptLoadState) -> Result<(), String> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_partial_load(&self, _state: &ScriptLoadState) -> Result<(), String> {
            self.partials.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failing_hooks_do_not_block_others() {
        let registry = HookRegistry::new();
        let counting = Arc::new(Counting::default());
        registry.register(Arc::new(Failing));
        registry.register(counting.clone());
        assert_eq!(registry.len(), 2);

        let state = ScriptLoadState::pending("GTM-ABC123", "src", 0).with_status(ScriptStatus::Failed);
        registry.on_script_error(&state);
        registry.on_partial_load(&state);
        registry.on_script_loaded(&state);

        assert_eq!(counting.errors.load(Ordering::SeqCst), 1);
        assert_eq!(counting.partials.load(Ordering::SeqCst), 1);
    }
}
