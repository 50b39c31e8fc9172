//! # Tagpilot Core
//!
//! Core abstractions and deterministic logic for the tagpilot client engine.
//!
//! This crate contains:
//! - Container / consent / script-state definitions
//! - Consent command construction and signatures
//! - The host boundary (global scope, document, shared data layer array)
//! - DataLayerStore (adopt / push / trim / restore)
//! - Pure URL and noscript markup builders
//!
//! This crate does NOT care about:
//! - Timers, retries or readiness
//! - How many client instances share a data layer
//! - Where configuration comes from

pub mod canonical;
pub mod consent;
pub mod error;
pub mod host;
pub mod markup;
pub mod options;
pub mod store;
pub mod types;
pub mod validate;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::consent::{
        build_consent_command, normalize_consent_state, signature_of_entry, CommandKind,
        ConsentCommand, ConsentOptions, ConsentSignal, ConsentState, ConsentValue,
    };
    pub use crate::error::{ClientError, ConfigurationError, HostError, ValidationError};
    pub use crate::host::{
        DataLayerArray, Document, ElementId, GlobalScope, GlobalValue, ListenerId, ScriptHandlers,
        ScriptSpec, UnloadListener,
    };
    pub use crate::options::{ClientOptions, ConsentPolicy, RetryPolicy};
    pub use crate::store::DataLayerStore;
    pub use crate::types::{ContainerDescriptor, ScriptLoadState, ScriptStatus};
}

// Re-export key types at crate root
pub use consent::{ConsentCommand, ConsentOptions, ConsentState};
pub use error::{ClientError, ConfigurationError, HostError, ValidationError};
pub use host::{DataLayerArray, Document, GlobalScope, GlobalValue};
pub use options::{ClientOptions, ConsentPolicy, RetryPolicy};
pub use store::DataLayerStore;
pub use types::{ContainerDescriptor, ScriptLoadState, ScriptStatus};

/// Default name of the shared data layer global.
pub const DEFAULT_DATA_LAYER_NAME: &str = "dataLayer";

/// Default vendor host serving `gtm.js` and `ns.html`.
pub const DEFAULT_HOST: &str = "https://www.googletagmanager.com";

/// How long a loaded container may take to register with the vendor runtime.
pub const DEFAULT_INITIALIZATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Attribute marking an injected script element with its container id.
pub const CONTAINER_MARKER_ATTRIBUTE: &str = "data-gtm-container-id";

/// Global under which the vendor runtime registers loaded containers.
pub const VENDOR_RUNTIME_GLOBAL: &str = "google_tag_manager";
