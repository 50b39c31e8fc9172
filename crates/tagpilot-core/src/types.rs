//! Container and script-load state definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One vendor container instance.
///
/// Immutable once handed to the script manager; several descriptors may
/// share a single data layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub id: String,
    /// Extra query parameters appended to the script and noscript URLs,
    /// in insertion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_params: Vec<(String, String)>,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query_params: Vec::new(),
        }
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }
}

impl From<&str> for ContainerDescriptor {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContainerDescriptor {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Load status of one container's script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    /// Injected (or waiting to be re-injected), no terminal signal yet
    Pending,
    /// Load signal received
    Loaded,
    /// Load failed and no retries remain
    Failed,
    /// Script loaded but the vendor runtime never registered the container
    Partial,
    /// Page unloaded while still pending
    Skipped,
}

impl ScriptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ScriptStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScriptStatus::Pending => "pending",
            ScriptStatus::Loaded => "loaded",
            ScriptStatus::Failed => "failed",
            ScriptStatus::Partial => "partial",
            ScriptStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one load attempt for one container.
///
/// A retry produces a new value rather than mutating the previous one, so
/// every attempt keeps its own timing and error data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLoadState {
    pub container_id: String,
    pub src: String,
    pub status: ScriptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when an existing script element was adopted instead of injected.
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time_ms: Option<u64>,
    /// Zero-based attempt number (0 = initial injection).
    #[serde(default)]
    pub attempt: u32,
}

impl ScriptLoadState {
    pub fn pending(container_id: impl Into<String>, src: impl Into<String>, attempt: u32) -> Self {
        Self {
            container_id: container_id.into(),
            src: src.into(),
            status: ScriptStatus::Pending,
            error: None,
            from_cache: false,
            load_time_ms: None,
            attempt,
        }
    }

    /// State for a container whose script element already existed.
    pub fn cached(container_id: impl Into<String>, src: impl Into<String>) -> Self {
        Self {
            status: ScriptStatus::Loaded,
            from_cache: true,
            ..Self::pending(container_id, src, 0)
        }
    }

    pub fn with_status(&self, status: ScriptStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_load_time(mut self, load_time_ms: u64) -> Self {
        self.load_time_ms = Some(load_time_ms);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_snake_case() {
        let state = ScriptLoadState::pending("GTM-ABC123", "https://x/gtm.js?id=GTM-ABC123", 0)
            .with_status(ScriptStatus::Partial);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["container_id"], "GTM-ABC123");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_cached_state_is_terminal_loaded() {
        let state = ScriptLoadState::cached("GTM-ABC123", "src");
        assert!(state.is_terminal());
        assert!(state.from_cache);
        assert_eq!(state.status, ScriptStatus::Loaded);
    }
}
