//! TagClient - the public orchestration engine
//!
//! Before `init` every event and consent command is queued. `init` adopts
//! the data layer and flushes in a fixed order:
//!
//! 1. the start marker (only when none is present yet)
//! 2. queued consent commands, in enqueue order
//! 3. queued events, in enqueue order
//!
//! and then hands the configured containers to the [`ScriptManager`].
//! After `init`, writes go straight through the data layer store.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use tagpilot_core::consent::{build_consent_command, signature_of_entry, CommandKind};
use tagpilot_core::error::describe;
use tagpilot_core::host::{Document, GlobalScope, GlobalValue};
use tagpilot_core::markup::noscript_markup;
use tagpilot_core::store::{is_start_marker, start_marker};
use tagpilot_core::validate::{is_valid_container_id, validate_data_layer_name, validate_host};
use tagpilot_core::{
    ClientError, ClientOptions, ConfigurationError, ConsentCommand, ConsentOptions, ConsentState,
    DataLayerStore, ScriptLoadState, ValidationError,
};

use crate::diagnostics::ClientDiagnostics;
use crate::hooks::ScriptHook;
use crate::readiness::ReadySubscription;
use crate::registry;
use crate::script_manager::{ScriptManager, ScriptSettings};

enum QueueEntry {
    Event(Value),
    Consent {
        command: ConsentCommand,
        signature: String,
    },
}

impl QueueEntry {
    fn signature(&self) -> Option<&str> {
        match self {
            QueueEntry::Event(_) => None,
            QueueEntry::Consent { signature, .. } => Some(signature),
        }
    }
}

/// Signatures of consent commands delivered this session.
///
/// With a window, only the most recent `window` signatures are remembered.
struct SignatureLog {
    window: Option<usize>,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl SignatureLog {
    fn new(window: Option<usize>) -> Self {
        Self {
            window,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, signature: &str) -> bool {
        self.seen.contains(signature)
    }

    fn insert(&mut self, signature: String) {
        if !self.seen.insert(signature.clone()) {
            return;
        }
        self.order.push_back(signature);
        if let Some(window) = self.window {
            while self.order.len() > window {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
    }

    fn remove(&mut self, signature: &str) {
        if self.seen.remove(signature) {
            self.order.retain(|s| s != signature);
        }
    }
}

/// State that exists only between `init` and `teardown`.
///
/// The store is shared so writes can run without the client lock: the
/// data layer's append operation may be third-party code that calls back
/// into the client.
struct Session {
    store: Arc<DataLayerStore>,
    delivered: SignatureLog,
    consent_delivered: usize,
    started_at: Instant,
}

impl Session {
    /// Claim a consent signature before writing it.
    /// Returns false when it was already delivered.
    fn reserve_consent(&mut self, kind: CommandKind, signature: &str) -> bool {
        if self.delivered.contains(signature) {
            tracing::debug!(kind = %kind, "consent command already delivered; skipping");
            return false;
        }
        self.delivered.insert(signature.to_string());
        self.consent_delivered += 1;
        true
    }

    /// Give back a claim whose write failed.
    fn release_consent(&mut self, signature: &str) {
        self.delivered.remove(signature);
        self.consent_delivered = self.consent_delivered.saturating_sub(1);
    }
}

#[derive(Default)]
struct ClientState {
    queue: Vec<QueueEntry>,
    session: Option<Session>,
    /// Set while `init` drains the queue; writes keep queueing until it ends.
    flushing: bool,
}

/// Client orchestration engine for one set of containers on one data layer.
pub struct TagClient {
    instance_id: Uuid,
    options: ClientOptions,
    scope: Arc<dyn GlobalScope>,
    scripts: ScriptManager,
    state: Mutex<ClientState>,
}

impl TagClient {
    /// Validate `options` and build a client.
    ///
    /// Invalid container ids mixed with valid ones are skipped with a
    /// warning; if none are valid the first offending id is reported. Call
    /// this inside a tokio runtime so script retries and timeouts can run.
    pub fn new(
        options: ClientOptions,
        scope: Arc<dyn GlobalScope>,
        document: Arc<dyn Document>,
    ) -> Result<Self, ClientError> {
        let mut options = options;
        if options.containers.is_empty() {
            return Err(ConfigurationError::NoContainers.into());
        }
        validate_data_layer_name(&options.data_layer_name)?;
        validate_host(&options.host)?;

        let (valid, invalid): (Vec<_>, Vec<_>) = options
            .containers
            .drain(..)
            .partition(|container| is_valid_container_id(&container.id));
        if valid.is_empty() {
            let offending = invalid
                .first()
                .map(|container| container.id.clone())
                .unwrap_or_default();
            return Err(ConfigurationError::InvalidContainerId(offending).into());
        }
        for container in &invalid {
            tracing::warn!(container_id = %container.id, "skipping invalid container id");
        }
        options.containers = valid;

        let instance_id = Uuid::new_v4();
        let scripts = ScriptManager::new(document, scope.clone(), ScriptSettings::from(&options));
        tracing::debug!(
            instance_id = %instance_id,
            data_layer = %options.data_layer_name,
            containers = options.containers.len(),
            "tag client created"
        );

        Ok(Self {
            instance_id,
            options,
            scope,
            scripts,
            state: Mutex::new(ClientState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Options after validation (invalid containers removed).
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn data_layer_name(&self) -> &str {
        &self.options.data_layer_name
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Queue or write one event. Only JSON objects are accepted.
    pub fn push(&self, event: Value) -> Result<(), ClientError> {
        if !event.is_object() {
            return Err(ValidationError::NotARecord(describe(&event)).into());
        }

        let store = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.session.as_ref() {
                Some(session) if !state.flushing => session.store.clone(),
                _ => {
                    state.queue.push(QueueEntry::Event(event));
                    if self.options.debug {
                        tracing::debug!(queue_size = state.queue.len(), "event queued until init");
                    }
                    return Ok(());
                }
            }
        };

        store.push(event);
        store.trim(self.options.max_data_layer_size);
        if self.options.debug {
            tracing::debug!(data_layer = %self.options.data_layer_name, "event pushed");
        }
        Ok(())
    }

    pub fn set_consent_defaults(
        &self,
        consent: ConsentState,
        options: Option<ConsentOptions>,
    ) -> Result<(), ClientError> {
        self.submit_consent(CommandKind::Default, consent, options)
    }

    pub fn update_consent(
        &self,
        consent: ConsentState,
        options: Option<ConsentOptions>,
    ) -> Result<(), ClientError> {
        self.submit_consent(CommandKind::Update, consent, options)
    }

    fn submit_consent(
        &self,
        kind: CommandKind,
        consent: ConsentState,
        options: Option<ConsentOptions>,
    ) -> Result<(), ClientError> {
        let command = build_consent_command(kind, consent, options, &self.options.consent)?;
        let signature = command.signature();

        let store = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.session.as_mut() {
                Some(session) if !state.flushing => {
                    if !session.reserve_consent(kind, &signature) {
                        return Ok(());
                    }
                    session.store.clone()
                }
                _ => {
                    if state
                        .queue
                        .iter()
                        .any(|entry| entry.signature() == Some(signature.as_str()))
                    {
                        tracing::debug!(kind = %kind, "identical consent command already queued; dropping");
                        return Ok(());
                    }
                    state.queue.push(QueueEntry::Consent { command, signature });
                    if self.options.debug {
                        tracing::debug!(kind = %kind, queue_size = state.queue.len(), "consent command queued until init");
                    }
                    return Ok(());
                }
            }
        };

        if self.write_consent(&store, &command, &signature) {
            store.trim(self.options.max_data_layer_size);
        }
        Ok(())
    }

    /// Write a reserved consent command; the reservation is dropped if the
    /// write fails. Called without the client lock held.
    fn write_consent(&self, store: &DataLayerStore, command: &ConsentCommand, signature: &str) -> bool {
        if store.push(command.to_entry()) {
            if self.options.debug {
                tracing::debug!(data_layer = %store.name(), kind = %command.kind(), "consent command delivered");
            }
            return true;
        }
        if let Some(session) = self.lock().session.as_mut() {
            session.release_consent(signature);
        }
        false
    }

    /// Adopt the data layer, flush the queue and start loading containers.
    /// A second call while initialized does nothing.
    pub fn init(&self) {
        let (store, needs_marker) = {
            let mut state = self.lock();
            if state.session.is_some() {
                tracing::debug!(instance_id = %self.instance_id, "init called on initialized client");
                return;
            }

            let name = &self.options.data_layer_name;
            let active = registry::acquire(name);
            if active > 1 {
                tracing::warn!(
                    data_layer = %name,
                    active_instances = active,
                    instance_id = %self.instance_id,
                    "another client is already initialized on this data layer"
                );
            }

            let store = Arc::new(DataLayerStore::adopt(name.clone(), self.scope.clone()));
            let mut delivered = SignatureLog::new(self.options.consent.dedupe_window);
            for signature in store.initial_entries().iter().filter_map(signature_of_entry) {
                delivered.insert(signature);
            }
            let needs_marker = !store.initial_entries().iter().any(is_start_marker);

            state.session = Some(Session {
                store: store.clone(),
                delivered,
                consent_delivered: 0,
                started_at: Instant::now(),
            });
            state.flushing = true;
            (store, needs_marker)
        };

        if needs_marker {
            store.push(start_marker());
        }
        let Some(flushed) = self.flush_queue(&store) else {
            tracing::debug!(instance_id = %self.instance_id, "client torn down during init");
            return;
        };
        store.trim(self.options.max_data_layer_size);

        tracing::info!(
            instance_id = %self.instance_id,
            data_layer = %self.options.data_layer_name,
            adopted_existing = store.adopted_existing(),
            flushed,
            "tag client initialized"
        );

        self.scripts.ensure(&self.options.containers);
    }

    /// Drain the queue into `store`: consent commands first, then events.
    ///
    /// Entries queued while a batch is being written form the next batch.
    /// Returns `None` if the client was torn down meanwhile.
    fn flush_queue(&self, store: &DataLayerStore) -> Option<usize> {
        let mut flushed = 0usize;
        loop {
            let (consents, events) = {
                let mut guard = self.lock();
                let state = &mut *guard;
                let session = state.session.as_mut()?;
                if state.queue.is_empty() {
                    state.flushing = false;
                    return Some(flushed);
                }
                let queue = std::mem::take(&mut state.queue);
                flushed += queue.len();
                let mut consents = Vec::new();
                let mut events = Vec::new();
                for entry in queue {
                    match entry {
                        QueueEntry::Consent { command, signature } => {
                            if session.reserve_consent(command.kind(), &signature) {
                                consents.push((command, signature));
                            }
                        }
                        QueueEntry::Event(event) => events.push(event),
                    }
                }
                (consents, events)
            };

            for (command, signature) in &consents {
                self.write_consent(store, command, signature);
            }
            for event in events {
                store.push(event);
            }
        }
    }

    /// Undo `init`: remove scripts, restore the data layer and forget queued
    /// and delivered commands. Safe to call at any time, any number of times.
    pub fn teardown(&self) {
        let session = {
            let mut state = self.lock();
            state.queue.clear();
            state.flushing = false;
            state.session.take()
        };
        let Some(session) = session else {
            tracing::debug!(instance_id = %self.instance_id, "teardown called on uninitialized client");
            return;
        };

        self.scripts.teardown();
        session.store.restore();

        let name = &self.options.data_layer_name;
        let remaining = registry::release(name);
        if remaining > 0 {
            tracing::warn!(
                data_layer = %name,
                remaining_instances = remaining,
                instance_id = %self.instance_id,
                "client torn down while other clients still use this data layer"
            );
        }
        tracing::info!(instance_id = %self.instance_id, data_layer = %name, "tag client torn down");
    }

    pub fn register_hook(&self, hook: Arc<dyn ScriptHook>) {
        self.scripts.register_hook(hook);
    }

    /// Resolves once every container script reached a terminal state.
    pub async fn when_ready(&self) -> Vec<ScriptLoadState> {
        self.scripts.when_ready().await
    }

    pub fn on_ready<F>(&self, callback: F) -> ReadySubscription
    where
        F: FnOnce(&[ScriptLoadState]) + Send + 'static,
    {
        self.scripts.on_ready(callback)
    }

    pub fn script_states(&self) -> Vec<ScriptLoadState> {
        self.scripts.states()
    }

    /// All attempts for one container, oldest first.
    pub fn attempt_history(&self, container_id: &str) -> Vec<ScriptLoadState> {
        self.scripts.attempt_history(container_id)
    }

    /// Current contents of the data layer global.
    pub fn data_layer(&self) -> Vec<Value> {
        match self.scope.get(&self.options.data_layer_name) {
            Some(GlobalValue::Array(array)) => array.snapshot(),
            _ => Vec::new(),
        }
    }

    /// `<noscript>` fallback markup for every configured container.
    pub fn noscript_html(&self) -> String {
        self.options
            .containers
            .iter()
            .map(|container| {
                noscript_markup(&self.options.host, container, &self.options.noscript_attributes)
            })
            .collect()
    }

    pub fn diagnostics(&self) -> ClientDiagnostics {
        let (initialized, queue_size, consent_delivered, uptime_ms) = {
            let state = self.lock();
            match &state.session {
                Some(session) => (
                    true,
                    state.queue.len(),
                    session.consent_delivered,
                    u64::try_from(session.started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                ),
                None => (false, state.queue.len(), 0, 0),
            }
        };

        ClientDiagnostics {
            instance_id: self.instance_id.to_string(),
            initialized,
            ready: self.scripts.is_ready(),
            data_layer_name: self.options.data_layer_name.clone(),
            data_layer_size: self.data_layer().len(),
            queue_size,
            consent_commands_delivered: consent_delivered,
            containers: self
                .options
                .containers
                .iter()
                .map(|container| container.id.clone())
                .collect(),
            script_states: self.scripts.states(),
            active_instances: registry::active_instances(&self.options.data_layer_name),
            uptime_ms,
            debug_mode: self.options.debug,
        }
    }
}

impl Drop for TagClient {
    fn drop(&mut self) {
        let initialized = self.lock().session.is_some();
        if initialized {
            registry::release(&self.options.data_layer_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tagpilot_core::consent::{is_consent_entry, normalize_consent_state};
    use tagpilot_core::host::PushInterceptor;
    use tagpilot_core::store::start_marker_at;
    use tagpilot_core::{ConsentPolicy, ContainerDescriptor, RetryPolicy, ScriptStatus};
    use tagpilot_stores::{InMemoryDocument, InMemoryWindow};

    const ID: &str = "GTM-ABC123";

    struct Harness {
        client: TagClient,
        window: Arc<InMemoryWindow>,
        document: Arc<InMemoryDocument>,
    }

    fn harness(options: ClientOptions) -> Harness {
        let window = Arc::new(InMemoryWindow::new());
        let document = Arc::new(InMemoryDocument::new());
        let client = TagClient::new(options, window.clone(), document.clone()).unwrap();
        Harness {
            client,
            window,
            document,
        }
    }

    fn options(layer: &str) -> ClientOptions {
        ClientOptions::new([ID]).with_data_layer_name(layer)
    }

    fn consent(v: Value) -> ConsentState {
        normalize_consent_state(&v).unwrap()
    }

    fn consent_entries(entries: &[Value]) -> Vec<Value> {
        entries.iter().filter(|e| is_consent_entry(e)).cloned().collect()
    }

    #[test]
    fn test_new_rejects_bad_configuration() {
        let window: Arc<InMemoryWindow> = Arc::new(InMemoryWindow::new());
        let document: Arc<InMemoryDocument> = Arc::new(InMemoryDocument::new());
        let build = |options: ClientOptions| {
            TagClient::new(options, window.clone(), document.clone()).map(|_| ())
        };

        let empty: [&str; 0] = [];
        assert_eq!(
            build(ClientOptions::new(empty)),
            Err(ClientError::Configuration(ConfigurationError::NoContainers))
        );
        assert_eq!(
            build(ClientOptions::new([ID]).with_data_layer_name("var")),
            Err(ClientError::Configuration(
                ConfigurationError::InvalidDataLayerName("var".to_string())
            ))
        );
        assert_eq!(
            build(ClientOptions::new(["UA-123"])),
            Err(ClientError::Configuration(
                ConfigurationError::InvalidContainerId("UA-123".to_string())
            ))
        );
        assert!(matches!(
            build(ClientOptions::new([ID]).with_host("ftp://example.com")),
            Err(ClientError::Configuration(ConfigurationError::InvalidHost(_)))
        ));
    }

    #[test]
    fn test_invalid_containers_are_skipped_when_mixed() {
        let h = harness(ClientOptions::new(["bad", ID]).with_data_layer_name("dl_mixed"));
        let ids: Vec<&str> = h
            .client
            .options()
            .containers
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec![ID]);
    }

    #[test]
    fn test_push_accepts_only_records() {
        let h = harness(options("dl_records"));
        assert!(matches!(
            h.client.push(json!(["not", "a", "record"])),
            Err(ClientError::Validation(ValidationError::NotARecord(_)))
        ));
        assert!(h.client.push(json!("text")).is_err());
        assert!(h.client.push(json!({"event": "ok"})).is_ok());
        assert_eq!(h.client.diagnostics().queue_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_flushes_in_order() {
        let h = harness(options("dl_flush_order"));
        h.client.push(json!({"event": "first"})).unwrap();
        h.client
            .set_consent_defaults(consent(json!({"analytics_storage": "denied"})), None)
            .unwrap();
        h.client.push(json!({"event": "second"})).unwrap();
        h.client
            .set_consent_defaults(consent(json!({"analytics_storage": "denied"})), None)
            .unwrap();
        h.client.push(json!({"event": "first"})).unwrap();
        assert!(h.window.entries("dl_flush_order").is_none());

        h.client.init();

        let entries = h.window.entries("dl_flush_order").unwrap();
        assert_eq!(entries.len(), 5);
        assert!(is_start_marker(&entries[0]));
        assert_eq!(entries[1], json!(["consent", "default", {"analytics_storage": "denied"}]));
        assert_eq!(entries[2], json!({"event": "first"}));
        assert_eq!(entries[3], json!({"event": "second"}));
        assert_eq!(entries[4], json!({"event": "first"}));
        assert_eq!(h.client.diagnostics().queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_start_marker_is_not_duplicated() {
        let h = harness(options("dl_existing_marker"));
        h.window
            .set_array("dl_existing_marker", vec![start_marker_at(1_700_000_000_000)]);
        h.client.init();

        let entries = h.window.entries("dl_existing_marker").unwrap();
        assert_eq!(entries.iter().filter(|e| is_start_marker(e)).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_consent_is_deduplicated_after_init() {
        let h = harness(options("dl_update_dedupe"));
        h.client.init();

        h.client
            .update_consent(consent(json!({"ad_storage": "granted", "analytics_storage": "denied"})), None)
            .unwrap();
        h.client
            .update_consent(consent(json!({"analytics_storage": "denied", "ad_storage": "granted"})), None)
            .unwrap();
        assert_eq!(consent_entries(&h.client.data_layer()).len(), 1);

        h.client
            .update_consent(consent(json!({"ad_storage": "denied"})), None)
            .unwrap();
        assert_eq!(consent_entries(&h.client.data_layer()).len(), 2);
        assert_eq!(h.client.diagnostics().consent_commands_delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedupe_window_forgets_old_signatures() {
        let policy = ConsentPolicy {
            dedupe_window: Some(1),
            ..ConsentPolicy::default()
        };
        let h = harness(options("dl_dedupe_window").with_consent_policy(policy));
        h.client.init();

        let granted = json!({"ad_storage": "granted"});
        let denied = json!({"ad_storage": "denied"});
        h.client.update_consent(consent(granted.clone()), None).unwrap();
        h.client.update_consent(consent(denied), None).unwrap();
        h.client.update_consent(consent(granted), None).unwrap();
        assert_eq!(consent_entries(&h.client.data_layer()).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_consent_entries_are_not_redelivered() {
        let h = harness(options("dl_existing_consent"));
        h.window.set_array(
            "dl_existing_consent",
            vec![json!(["consent", "default", {"analytics_storage": "denied"}])],
        );
        h.client
            .set_consent_defaults(consent(json!({"analytics_storage": "denied"})), None)
            .unwrap();
        h.client.init();

        let entries = h.client.data_layer();
        assert_eq!(consent_entries(&entries).len(), 1);
        assert_eq!(h.client.diagnostics().consent_commands_delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_options_are_validated() {
        let h = harness(options("dl_consent_options"));
        let result = h.client.set_consent_defaults(
            consent(json!({"ad_storage": "denied"})),
            Some(ConsentOptions::new().with_wait_for_update_ms(-1.0)),
        );
        assert!(matches!(
            result,
            Err(ClientError::Validation(ValidationError::InvalidWaitForUpdate(_)))
        ));
        assert_eq!(h.client.diagnostics().queue_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_restores_adopted_array() {
        let h = harness(options("dl_restore_adopted"));
        let original = h
            .window
            .set_array("dl_restore_adopted", vec![json!({"event": "host"})]);
        h.client.init();
        for n in 0..10 {
            h.client.push(json!({"event": "e", "n": n})).unwrap();
        }
        h.client
            .update_consent(consent(json!({"ad_storage": "granted"})), None)
            .unwrap();

        h.client.teardown();

        assert_eq!(original.snapshot(), vec![json!({"event": "host"})]);
        assert!(h.window.array("dl_restore_adopted").unwrap().same_array(&original));
        assert!(!h.client.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_removes_created_binding() {
        let h = harness(options("dl_restore_created"));
        h.client.init();
        h.client.push(json!({"event": "e"})).unwrap();
        assert!(h.window.contains("dl_restore_created"));

        h.client.teardown();
        assert!(!h.window.contains("dl_restore_created"));
        assert!(h.document.scripts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_and_teardown_are_idempotent() {
        let h = harness(options("dl_idempotent"));
        h.client.init();
        h.client.init();
        assert_eq!(h.document.scripts_for(ID).len(), 1);
        assert_eq!(registry::active_instances("dl_idempotent"), 1);

        h.client.teardown();
        h.client.teardown();
        assert_eq!(registry::active_instances("dl_idempotent"), 0);
        assert!(!h.window.contains("dl_idempotent"));

        h.client.init();
        assert_eq!(h.document.scripts_for(ID).len(), 1);
        h.client.teardown();
    }

    #[test]
    fn test_teardown_without_init_is_safe() {
        let h = harness(options("dl_never_initialized"));
        h.client.push(json!({"event": "queued"})).unwrap();
        h.client.teardown();
        assert_eq!(h.client.diagnostics().queue_size, 0);
        assert!(!h.window.contains("dl_never_initialized"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trimming_preserves_critical_entries() {
        let h = harness(options("dl_trimmed").with_max_data_layer_size(5));
        h.client
            .set_consent_defaults(consent(json!({"ad_storage": "denied"})), None)
            .unwrap();
        h.client.init();
        for n in 0..20 {
            h.client.push(json!({"event": "e", "n": n})).unwrap();
        }

        let entries = h.client.data_layer();
        assert_eq!(entries.len(), 5);
        assert!(is_start_marker(&entries[0]));
        assert!(is_consent_entry(&entries[1]));
        assert_eq!(entries[4], json!({"event": "e", "n": 19}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throwing_push_is_absorbed() {
        let h = harness(options("dl_throwing"));
        h.client.init();
        let array = h.window.array("dl_throwing").unwrap();
        array.set_push_interceptor(Some(Arc::new(|_: &Value| Err("blocked".to_string()))));

        assert!(h.client.push(json!({"event": "lost"})).is_ok());
        array.set_push_interceptor(None);
        assert!(h.client.push(json!({"event": "kept"})).is_ok());
        assert_eq!(h.client.data_layer().last(), Some(&json!({"event": "kept"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_patched_push_can_call_back_into_client() {
        let window = Arc::new(InMemoryWindow::new());
        let document = Arc::new(InMemoryDocument::new());
        let client = Arc::new(TagClient::new(options("dl_reentrant"), window.clone(), document).unwrap());
        let array = window.set_array("dl_reentrant", Vec::new());

        let weak = Arc::downgrade(&client);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let interceptor: PushInterceptor = Arc::new(move |entry: &Value| -> Result<(), String> {
            let Some(client) = weak.upgrade() else {
                return Ok(());
            };
            if client.is_initialized() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            let follow_up = match entry.get("event").and_then(Value::as_str) {
                Some("queued") => Some("during_flush"),
                Some("outer") => Some("inner"),
                _ => None,
            };
            if let Some(event) = follow_up {
                client.push(json!({"event": event})).map_err(|err| err.to_string())?;
            }
            Ok(())
        });
        array.set_push_interceptor(Some(interceptor));

        client
            .set_consent_defaults(consent(json!({"ad_storage": "denied"})), None)
            .unwrap();
        client.push(json!({"event": "queued"})).unwrap();
        client.init();
        client.push(json!({"event": "outer"})).unwrap();
        client
            .update_consent(consent(json!({"ad_storage": "granted"})), None)
            .unwrap();

        let entries = array.snapshot();
        assert_eq!(entries.len(), 7);
        assert!(is_start_marker(&entries[0]));
        assert_eq!(entries[1], json!(["consent", "default", {"ad_storage": "denied"}]));
        assert_eq!(entries[2], json!({"event": "queued"}));
        assert_eq!(entries[3], json!({"event": "during_flush"}));
        assert_eq!(entries[4], json!({"event": "inner"}));
        assert_eq!(entries[5], json!({"event": "outer"}));
        assert_eq!(entries[6], json!(["consent", "update", {"ad_storage": "granted"}]));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(client.diagnostics().consent_commands_delivered, 2);
        assert_eq!(client.diagnostics().queue_size, 0);

        array.set_push_interceptor(None);
        client.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_consent_write_can_be_retried() {
        let h = harness(options("dl_rejected_consent"));
        h.client.init();
        let array = h.window.array("dl_rejected_consent").unwrap();
        array.set_push_interceptor(Some(Arc::new(|_: &Value| Err("blocked".to_string()))));

        let granted = json!({"analytics_storage": "granted"});
        h.client.update_consent(consent(granted.clone()), None).unwrap();
        assert_eq!(h.client.diagnostics().consent_commands_delivered, 0);

        array.set_push_interceptor(None);
        h.client.update_consent(consent(granted), None).unwrap();
        assert_eq!(consent_entries(&h.client.data_layer()).len(), 1);
        assert_eq!(h.client.diagnostics().consent_commands_delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_binding_is_recreated_on_push() {
        let h = harness(options("dl_replaced"));
        h.client.init();
        h.window.set_value("dl_replaced", Value::Null);

        h.client.push(json!({"event": "after"})).unwrap();
        assert_eq!(h.window.entries("dl_replaced"), Some(vec![json!({"event": "after"})]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_data_layer_counts_instances() {
        let first = harness(options("dl_shared"));
        let second = harness(options("dl_shared"));
        first.client.init();
        second.client.init();
        assert_eq!(registry::active_instances("dl_shared"), 2);
        assert_eq!(first.client.diagnostics().active_instances, 2);

        second.client.teardown();
        assert_eq!(registry::active_instances("dl_shared"), 1);
        first.client.teardown();
        assert_eq!(registry::active_instances("dl_shared"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_script_load() {
        let h = harness(options("dl_ready"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = h.client.on_ready(move |states| {
            assert_eq!(states.len(), 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        h.client.init();

        let scripts = h.document.scripts_for(ID);
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].spec.src.contains("id=GTM-ABC123"));
        h.document.fire_load(scripts[0].id);

        let states = h.client.when_ready().await;
        assert_eq!(states[0].container_id, ID);
        assert_eq!(states[0].status, ScriptStatus::Loaded);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let diagnostics = h.client.diagnostics();
        assert!(diagnostics.initialized);
        assert!(diagnostics.ready);
        assert_eq!(diagnostics.containers, vec![ID.to_string()]);
        assert_eq!(diagnostics.data_layer_size, 1);
        h.client.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_retries_surface_through_hook() {
        struct Errors(AtomicUsize);
        impl ScriptHook for Errors {
            fn on_script_error(&self, state: &ScriptLoadState) -> Result<(), String> {
                assert_eq!(state.status, ScriptStatus::Failed);
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let h = harness(
            options("dl_retry_hook").with_retry(RetryPolicy::new(2, std::time::Duration::from_millis(1_000))),
        );
        let errors = Arc::new(Errors(AtomicUsize::new(0)));
        h.client.register_hook(errors.clone());
        h.client.init();

        for wait_ms in [1_001, 2_001] {
            let element = h.document.scripts_for(ID)[0].id;
            h.document.fire_error(element, "blocked");
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
        }
        let element = h.document.scripts_for(ID)[0].id;
        h.document.fire_error(element, "blocked");

        assert_eq!(errors.0.load(Ordering::SeqCst), 1);
        assert_eq!(h.client.attempt_history(ID).len(), 3);
        h.client.teardown();
    }

    #[test]
    fn test_noscript_html_covers_all_containers() {
        let h = harness(
            ClientOptions::new([
                ContainerDescriptor::new(ID),
                ContainerDescriptor::new("GTM-DEF456").with_query_param("gtm_auth", "a&b"),
            ])
            .with_data_layer_name("dl_noscript"),
        );
        let html = h.client.noscript_html();
        assert_eq!(html.matches("<noscript>").count(), 2);
        assert!(html.contains("ns.html?id=GTM-DEF456&amp;gtm_auth=a%26b"));
    }
}
