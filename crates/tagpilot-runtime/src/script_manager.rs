//! ScriptManager - vendor script injection and load tracking
//!
//! Each configured container runs a small state machine:
//!
//! ```text
//! pending --load--> loaded --(verification timeout)--> partial
//!    |  \--error, retries left--> pending (new attempt, new element)
//!    |   \--error, no retries---> failed
//!    \--page unload-------------> skipped
//! ```
//!
//! Signals arrive from element listeners, timers and the document-wide
//! unload listener. Every handler carries the cycle and attempt it was
//! created for, so signals from torn-down cycles or replaced elements are
//! ignored.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};

use tagpilot_core::host::{
    Document, ElementId, GlobalScope, GlobalValue, ListenerId, ScriptHandlers, ScriptSpec,
};
use tagpilot_core::markup::script_url;
use tagpilot_core::{
    ClientOptions, ContainerDescriptor, RetryPolicy, ScriptLoadState, ScriptStatus,
    CONTAINER_MARKER_ATTRIBUTE, DEFAULT_DATA_LAYER_NAME, DEFAULT_HOST, DEFAULT_INITIALIZATION_TIMEOUT,
    VENDOR_RUNTIME_GLOBAL,
};

use crate::hooks::{HookRegistry, ScriptHook};
use crate::readiness::{ReadyCallback, ReadySubscription, Readiness};

const VERIFICATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settings the script manager needs from the client options.
#[derive(Debug, Clone)]
pub struct ScriptSettings {
    pub host: String,
    pub data_layer_name: String,
    pub script_attributes: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub load_timeout: Option<Duration>,
    pub verify_initialization: bool,
    pub initialization_timeout: Duration,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            data_layer_name: DEFAULT_DATA_LAYER_NAME.to_string(),
            script_attributes: Vec::new(),
            retry: RetryPolicy::default(),
            load_timeout: None,
            verify_initialization: false,
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
        }
    }
}

impl From<&ClientOptions> for ScriptSettings {
    fn from(options: &ClientOptions) -> Self {
        Self {
            host: options.host.clone(),
            data_layer_name: options.data_layer_name.clone(),
            script_attributes: options.script_attributes.clone(),
            retry: options.retry.clone(),
            load_timeout: options.load_timeout,
            verify_initialization: options.verify_initialization,
            initialization_timeout: options.initialization_timeout,
        }
    }
}

struct ContainerSlot {
    descriptor: ContainerDescriptor,
    src: String,
    current: ScriptLoadState,
    /// Earlier attempts, oldest first. `current` is not included.
    history: Vec<ScriptLoadState>,
    element: Option<ElementId>,
    injected_at: Option<Instant>,
    verifying: bool,
    timers: Vec<AbortHandle>,
}

impl ContainerSlot {
    fn new(descriptor: ContainerDescriptor, src: String, current: ScriptLoadState) -> Self {
        Self {
            descriptor,
            src,
            current,
            history: Vec::new(),
            element: None,
            injected_at: None,
            verifying: false,
            timers: Vec::new(),
        }
    }

    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn is_settled(&self) -> bool {
        self.current.is_terminal() && !self.verifying
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

struct ManagerState {
    cycle: u64,
    slots: Vec<ContainerSlot>,
    unload_listener: Option<ListenerId>,
}

impl ManagerState {
    fn states(&self) -> Vec<ScriptLoadState> {
        self.slots.iter().map(|s| s.current.clone()).collect()
    }

    /// Slot still waiting on exactly this attempt in this cycle.
    fn live_slot(&self, cycle: u64, container_id: &str, attempt: u32) -> Option<usize> {
        if self.cycle != cycle {
            return None;
        }
        self.slots.iter().position(|slot| {
            slot.id() == container_id
                && slot.current.attempt == attempt
                && slot.current.status == ScriptStatus::Pending
        })
    }
}

enum Notice {
    Loaded(ScriptLoadState),
    Failed(ScriptLoadState),
    Partial(ScriptLoadState),
}

/// One script element to insert for a given attempt.
struct Injection {
    cycle: u64,
    container_id: String,
    attempt: u32,
    spec: ScriptSpec,
}

/// Side effects collected under the lock and applied after releasing it.
///
/// Host calls happen here too: a document may deliver load or error
/// signals synchronously from inside `inject_script`.
#[derive(Default)]
struct Effects {
    removals: Vec<ElementId>,
    injections: Vec<Injection>,
    notices: Vec<Notice>,
    settle: Option<Vec<ScriptLoadState>>,
}

struct Shared {
    document: Arc<dyn Document>,
    scope: Arc<dyn GlobalScope>,
    settings: ScriptSettings,
    hooks: HookRegistry,
    readiness: Readiness,
    runtime: Option<Handle>,
    state: Mutex<ManagerState>,
}

/// Injects and tracks vendor script elements, one per container.
pub struct ScriptManager {
    shared: Arc<Shared>,
}

impl ScriptManager {
    /// Create a manager. Timers (retry, load timeout, verification) run on
    /// the tokio runtime current at construction; without one they are
    /// disabled and logged.
    pub fn new(
        document: Arc<dyn Document>,
        scope: Arc<dyn GlobalScope>,
        settings: ScriptSettings,
    ) -> Self {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            tracing::warn!("no tokio runtime available; script retries and timeouts are disabled");
        }
        Self {
            shared: Arc::new(Shared {
                document,
                scope,
                settings,
                hooks: HookRegistry::new(),
                readiness: Readiness::new(),
                runtime,
                state: Mutex::new(ManagerState {
                    cycle: 0,
                    slots: Vec::new(),
                    unload_listener: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &ScriptSettings {
        &self.shared.settings
    }

    pub fn register_hook(&self, hook: Arc<dyn ScriptHook>) {
        self.shared.hooks.register(hook);
    }

    /// Inject (or adopt) a script for every container not yet tracked.
    pub fn ensure(&self, containers: &[ContainerDescriptor]) {
        self.shared.ensure(containers);
    }

    /// Current state of every tracked container, in configuration order.
    pub fn states(&self) -> Vec<ScriptLoadState> {
        self.shared.lock().states()
    }

    pub fn state(&self, container_id: &str) -> Option<ScriptLoadState> {
        self.shared
            .lock()
            .slots
            .iter()
            .find(|slot| slot.id() == container_id)
            .map(|slot| slot.current.clone())
    }

    /// Every attempt for one container, oldest first, ending with the current one.
    pub fn attempt_history(&self, container_id: &str) -> Vec<ScriptLoadState> {
        let state = self.shared.lock();
        state
            .slots
            .iter()
            .find(|slot| slot.id() == container_id)
            .map(|slot| {
                let mut attempts = slot.history.clone();
                attempts.push(slot.current.clone());
                attempts
            })
            .unwrap_or_default()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.shared
            .lock()
            .slots
            .iter()
            .map(|slot| slot.id().to_string())
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.readiness.is_settled()
    }

    /// The states the current readiness cycle settled with, if it has.
    pub fn settled_states(&self) -> Option<Vec<ScriptLoadState>> {
        self.shared.readiness.settled_states()
    }

    /// Resolves once every tracked container reached a terminal state.
    pub async fn when_ready(&self) -> Vec<ScriptLoadState> {
        self.shared.readiness.wait().await
    }

    /// Run `callback` when ready, or now if readiness already settled.
    pub fn on_ready<F>(&self, callback: F) -> ReadySubscription
    where
        F: FnOnce(&[ScriptLoadState]) + Send + 'static,
    {
        let callback: ReadyCallback = Box::new(callback);
        self.shared.readiness.on_ready(callback)
    }

    /// Remove injected elements, cancel timers, drop the unload listener and
    /// start a fresh readiness cycle.
    pub fn teardown(&self) {
        self.shared.teardown();
    }
}

impl Drop for ScriptManager {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        for slot in &mut state.slots {
            slot.cancel_timers();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.spawn(task).abort_handle())
    }

    fn ensure(self: &Arc<Self>, containers: &[ContainerDescriptor]) {
        self.ensure_unload_listener();

        let state = self.lock();
        let candidates: Vec<&ContainerDescriptor> = containers
            .iter()
            .filter(|descriptor| {
                let tracked = state.slots.iter().any(|slot| slot.id() == descriptor.id);
                if tracked {
                    tracing::debug!(container_id = %descriptor.id, "container already tracked");
                }
                !tracked
            })
            .collect();
        drop(state);
        let existing: Vec<bool> = candidates
            .iter()
            .map(|descriptor| {
                self.document
                    .find_script(CONTAINER_MARKER_ATTRIBUTE, &descriptor.id)
                    .is_some()
            })
            .collect();

        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let cycle = state.cycle;
            let mut added = 0usize;
            for (descriptor, existing) in candidates.into_iter().zip(existing) {
                if state.slots.iter().any(|slot| slot.id() == descriptor.id) {
                    continue;
                }
                added += 1;
                let src = script_url(
                    &self.settings.host,
                    descriptor,
                    &self.settings.data_layer_name,
                );

                if existing {
                    tracing::info!(container_id = %descriptor.id, "adopting existing container script");
                    let current = ScriptLoadState::cached(descriptor.id.clone(), src.clone());
                    state
                        .slots
                        .push(ContainerSlot::new(descriptor.clone(), src, current));
                    continue;
                }

                let current = ScriptLoadState::pending(descriptor.id.clone(), src.clone(), 0);
                state
                    .slots
                    .push(ContainerSlot::new(descriptor.clone(), src, current));
                let index = state.slots.len() - 1;
                let injection = self.prepare_injection(&mut state.slots[index], cycle);
                effects.injections.push(injection);
            }

            if added > 0 && self.readiness.is_settled() {
                self.readiness.reset();
            }
            effects.settle = Self::ready_states(&state);
        }
        self.apply(effects);
    }

    fn ensure_unload_listener(self: &Arc<Self>) {
        if self.lock().unload_listener.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let listener = self.document.add_unload_listener(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.handle_unload();
            }
        }));
        let installed = {
            let mut state = self.lock();
            if state.unload_listener.is_none() {
                state.unload_listener = Some(listener);
                true
            } else {
                false
            }
        };
        if !installed {
            self.document.remove_unload_listener(listener);
        }
    }

    fn handlers(self: &Arc<Self>, cycle: u64, container_id: &str, attempt: u32) -> ScriptHandlers {
        let on_load = {
            let weak = Arc::downgrade(self);
            let container_id = container_id.to_string();
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_load(cycle, &container_id, attempt);
                }
            })
        };
        let on_error = {
            let weak = Arc::downgrade(self);
            let container_id = container_id.to_string();
            Arc::new(move |message: String| {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_error(cycle, &container_id, attempt, message);
                }
            })
        };
        ScriptHandlers { on_load, on_error }
    }

    fn prepare_injection(&self, slot: &mut ContainerSlot, cycle: u64) -> Injection {
        let mut spec = ScriptSpec::new(slot.src.clone())
            .with_attribute(CONTAINER_MARKER_ATTRIBUTE, slot.id());
        for (key, value) in &self.settings.script_attributes {
            spec = spec.with_attribute(key.clone(), value.clone());
        }
        slot.injected_at = Some(Instant::now());
        Injection {
            cycle,
            container_id: slot.id().to_string(),
            attempt: slot.current.attempt,
            spec,
        }
    }

    /// Insert one element. Called without the state lock held.
    fn inject(self: &Arc<Self>, injection: Injection) {
        let Injection {
            cycle,
            container_id,
            attempt,
            spec,
        } = injection;
        let handlers = self.handlers(cycle, &container_id, attempt);
        let result = self.document.inject_script(spec, handlers);

        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            match result {
                Ok(element) => {
                    tracing::debug!(container_id = %container_id, attempt, element = %element, "container script injected");
                    self.record_element(&mut state, cycle, &container_id, attempt, element, &mut effects);
                }
                Err(err) => {
                    tracing::warn!(container_id = %container_id, attempt, error = %err, "failed to inject container script");
                    if let Some(index) = state.live_slot(cycle, &container_id, attempt) {
                        self.fail_attempt(&mut state, index, err.to_string(), &mut effects);
                        effects.settle = Self::ready_states(&state);
                    }
                }
            }
        }
        self.apply(effects);
    }

    /// Attach an inserted element to its slot.
    ///
    /// Signals may already have moved the slot on while the element was being
    /// inserted; the element is then kept for the pending retry to replace, or
    /// removed when nothing owns it any more.
    fn record_element(
        self: &Arc<Self>,
        state: &mut ManagerState,
        cycle: u64,
        container_id: &str,
        attempt: u32,
        element: ElementId,
        effects: &mut Effects,
    ) {
        let slot = if state.cycle == cycle {
            state.slots.iter_mut().find(|slot| slot.id() == container_id)
        } else {
            None
        };
        let Some(slot) = slot else {
            effects.removals.push(element);
            return;
        };

        if slot.current.attempt != attempt {
            // this attempt already failed during insertion
            if slot.element.is_none() {
                slot.element = Some(element);
            } else {
                effects.removals.push(element);
            }
            return;
        }

        if let Some(displaced) = slot.element.replace(element) {
            if displaced != element {
                effects.removals.push(displaced);
            }
        }
        if slot.current.status == ScriptStatus::Pending {
            slot.timers
                .extend(self.load_timeout_timer(cycle, container_id, attempt));
        }
    }

    fn load_timeout_timer(
        self: &Arc<Self>,
        cycle: u64,
        container_id: &str,
        attempt: u32,
    ) -> Option<AbortHandle> {
        let timeout = self.settings.load_timeout?;
        let weak = Arc::downgrade(self);
        let container_id = container_id.to_string();
        self.spawn(async move {
            sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                let message = format!("script load timed out after {} ms", timeout.as_millis());
                shared.handle_error(cycle, &container_id, attempt, message);
            }
        })
    }

    fn handle_load(self: &Arc<Self>, cycle: u64, container_id: &str, attempt: u32) {
        let registered = self.settings.verify_initialization && self.vendor_registered(container_id);
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let Some(index) = state.live_slot(cycle, container_id, attempt) else {
                tracing::trace!(container_id, attempt, "ignoring stale load signal");
                return;
            };
            let verification = if self.settings.verify_initialization && !registered {
                self.spawn_verification(cycle, container_id)
            } else {
                None
            };

            let slot = &mut state.slots[index];
            slot.cancel_timers();
            let load_time_ms = slot
                .injected_at
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0);
            slot.current = slot
                .current
                .with_status(ScriptStatus::Loaded)
                .with_load_time(load_time_ms);
            tracing::info!(container_id, attempt, load_time_ms, "container script loaded");
            effects.notices.push(Notice::Loaded(slot.current.clone()));

            if let Some(timer) = verification {
                slot.verifying = true;
                slot.timers.push(timer);
            }
            effects.settle = Self::ready_states(&state);
        }
        self.apply(effects);
    }

    fn spawn_verification(self: &Arc<Self>, cycle: u64, container_id: &str) -> Option<AbortHandle> {
        let weak = Arc::downgrade(self);
        let container_id = container_id.to_string();
        let timeout = self.settings.initialization_timeout;
        self.spawn(async move {
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                sleep(VERIFICATION_POLL_INTERVAL.min(remaining)).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if shared.vendor_registered(&container_id) {
                    shared.finish_verification(cycle, &container_id, true);
                    return;
                }
                if Instant::now() >= deadline {
                    shared.finish_verification(cycle, &container_id, false);
                    return;
                }
            }
        })
    }

    fn vendor_registered(&self, container_id: &str) -> bool {
        matches!(
            self.scope.get(VENDOR_RUNTIME_GLOBAL),
            Some(GlobalValue::Value(Value::Object(registry))) if registry.contains_key(container_id)
        )
    }

    fn finish_verification(self: &Arc<Self>, cycle: u64, container_id: &str, confirmed: bool) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            if state.cycle != cycle {
                return;
            }
            let timeout_ms = self.settings.initialization_timeout.as_millis();
            let Some(slot) = state
                .slots
                .iter_mut()
                .find(|slot| slot.id() == container_id && slot.verifying)
            else {
                return;
            };
            slot.verifying = false;
            if confirmed {
                tracing::debug!(container_id, "vendor runtime registered container");
            } else {
                slot.current = slot
                    .current
                    .with_status(ScriptStatus::Partial)
                    .with_error(format!(
                        "container not registered by vendor runtime within {} ms",
                        timeout_ms
                    ));
                tracing::warn!(container_id, timeout_ms = timeout_ms as u64, "container script loaded but never initialized");
                effects.notices.push(Notice::Partial(slot.current.clone()));
            }
            effects.settle = Self::ready_states(&state);
        }
        self.apply(effects);
    }

    fn handle_error(self: &Arc<Self>, cycle: u64, container_id: &str, attempt: u32, message: String) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let Some(index) = state.live_slot(cycle, container_id, attempt) else {
                tracing::trace!(container_id, attempt, "ignoring stale error signal");
                return;
            };
            self.fail_attempt(&mut state, index, message, &mut effects);
            effects.settle = Self::ready_states(&state);
        }
        self.apply(effects);
    }

    /// Record a failed attempt and either schedule the next one or fail terminally.
    fn fail_attempt(
        self: &Arc<Self>,
        state: &mut ManagerState,
        index: usize,
        message: String,
        effects: &mut Effects,
    ) {
        let cycle = state.cycle;
        let retry = &self.settings.retry;
        let slot = &mut state.slots[index];
        slot.cancel_timers();

        let retries_used = slot.current.attempt;
        let failed = slot
            .current
            .with_status(ScriptStatus::Failed)
            .with_error(message.clone());

        let mut retry_timer = None;
        if retries_used < retry.attempts {
            let delay = retry.backoff(retries_used);
            let next_attempt = retries_used.saturating_add(1);
            let weak = Arc::downgrade(self);
            let container_id = slot.id().to_string();
            retry_timer = self.spawn(async move {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                if let Some(shared) = weak.upgrade() {
                    shared.retry(cycle, &container_id, next_attempt);
                }
            });
            if retry_timer.is_some() {
                tracing::warn!(
                    container_id = %slot.id(),
                    attempt = retries_used,
                    retry_attempt = next_attempt,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    max_retry_attempts = retry.attempts,
                    error = %message,
                    "container script failed; retrying"
                );
            }
        }

        match retry_timer {
            Some(timer) => {
                slot.history.push(failed);
                slot.current =
                    ScriptLoadState::pending(slot.id().to_string(), slot.src.clone(), retries_used + 1);
                slot.timers.push(timer);
            }
            None => {
                tracing::error!(
                    container_id = %slot.id(),
                    attempts = retries_used.saturating_add(1),
                    error = %message,
                    "container script failed"
                );
                slot.current = failed;
                effects.notices.push(Notice::Failed(slot.current.clone()));
            }
        }
    }

    fn retry(self: &Arc<Self>, cycle: u64, container_id: &str, attempt: u32) {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let Some(index) = state.live_slot(cycle, container_id, attempt) else {
                return;
            };
            let slot = &mut state.slots[index];
            effects.removals.extend(slot.element.take());
            tracing::info!(container_id, attempt, "retrying container script");
            let injection = self.prepare_injection(slot, cycle);
            effects.injections.push(injection);
        }
        self.apply(effects);
    }

    fn handle_unload(&self) {
        let states = {
            let mut state = self.lock();
            for slot in &mut state.slots {
                if slot.current.status == ScriptStatus::Pending {
                    slot.cancel_timers();
                    slot.current = slot.current.with_status(ScriptStatus::Skipped);
                    tracing::info!(container_id = %slot.id(), "page unloading; container script skipped");
                } else if slot.verifying {
                    slot.cancel_timers();
                    slot.verifying = false;
                }
            }
            state.states()
        };
        self.readiness.settle(states);
    }

    fn ready_states(state: &ManagerState) -> Option<Vec<ScriptLoadState>> {
        state
            .slots
            .iter()
            .all(ContainerSlot::is_settled)
            .then(|| state.states())
    }

    fn apply(self: &Arc<Self>, effects: Effects) {
        for element in effects.removals {
            if !self.document.remove_element(element) {
                tracing::debug!(element = %element, "script element already detached");
            }
        }
        for notice in effects.notices {
            match notice {
                Notice::Loaded(state) => self.hooks.on_script_loaded(&state),
                Notice::Failed(state) => self.hooks.on_script_error(&state),
                Notice::Partial(state) => self.hooks.on_partial_load(&state),
            }
        }
        if let Some(states) = effects.settle {
            if self.readiness.settle(states) {
                tracing::debug!("all container scripts settled");
            }
        }
        for injection in effects.injections {
            self.inject(injection);
        }
    }

    fn teardown(&self) {
        let (elements, listener, states) = {
            let mut state = self.lock();
            for slot in &mut state.slots {
                slot.cancel_timers();
            }
            let elements: Vec<ElementId> =
                state.slots.iter().filter_map(|slot| slot.element).collect();
            let states = state.states();
            let listener = state.unload_listener.take();
            state.slots.clear();
            state.cycle += 1;
            (elements, listener, states)
        };

        if let Some(listener) = listener {
            self.document.remove_unload_listener(listener);
        }
        for element in elements {
            if !self.document.remove_element(element) {
                tracing::debug!(element = %element, "script element already detached");
            }
        }
        self.readiness.settle(states);
        self.readiness.reset();
    }
}
