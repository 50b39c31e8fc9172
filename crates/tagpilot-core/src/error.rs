//! Error taxonomy.
//!
//! Only configuration and validation errors are ever returned to callers of
//! the client. Host errors are produced at the boundary and absorbed by the
//! engine (logged, reflected in states), never propagated.

use thiserror::Error;

/// Invalid construction-time configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid container id: {0:?} (expected GTM-XXXXXX)")]
    InvalidContainerId(String),

    #[error("invalid data layer name: {0:?} (must be a non-reserved identifier)")]
    InvalidDataLayerName(String),

    #[error("at least one container is required")]
    NoContainers,

    #[error("invalid host: {0:?}")]
    InvalidHost(String),
}

/// Malformed consent state, consent options or event payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("consent state must contain at least one signal")]
    EmptyConsentState,

    #[error("consent state must be an object, got {0}")]
    NotAnObject(String),

    #[error("unknown consent signal: {0:?}")]
    UnknownConsentSignal(String),

    #[error("invalid value for consent signal '{signal}': {value} (expected \"granted\" or \"denied\")")]
    InvalidConsentValue { signal: String, value: String },

    #[error("unsupported consent command kind: {0:?} (expected \"default\" or \"update\")")]
    UnsupportedCommandKind(String),

    #[error("invalid consent region: {0}")]
    InvalidRegion(String),

    #[error("invalid wait_for_update: {0}")]
    InvalidWaitForUpdate(String),

    #[error("data layer events must be plain objects, got {0}")]
    NotARecord(String),
}

/// Failure reported by the host environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("global binding '{0}' is not configurable")]
    NotConfigurable(String),

    #[error("data layer push rejected: {0}")]
    PushRejected(String),

    #[error("document has no head or body to insert into")]
    NoInsertionPoint,
}

/// Errors surfaced synchronously by the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Short description of a JSON value's shape for error messages.
pub fn describe(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => format!("boolean {}", b),
        serde_json::Value::Number(n) => format!("number {}", n),
        serde_json::Value::String(s) => format!("string {:?}", s),
        serde_json::Value::Array(items) => format!("array of {} item(s)", items.len()),
        serde_json::Value::Object(_) => "object".to_string(),
    }
}
