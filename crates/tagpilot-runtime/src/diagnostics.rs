//! Read-only client diagnostics.

use serde::Serialize;

use tagpilot_core::ScriptLoadState;

/// Point-in-time view of a client, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientDiagnostics {
    pub instance_id: String,
    pub initialized: bool,
    pub ready: bool,
    pub data_layer_name: String,
    pub data_layer_size: usize,
    /// Events and consent commands waiting for `init`.
    pub queue_size: usize,
    pub consent_commands_delivered: usize,
    pub containers: Vec<String>,
    pub script_states: Vec<ScriptLoadState>,
    /// Initialized clients sharing this data layer, this one included.
    pub active_instances: usize,
    /// Milliseconds since `init`; zero when not initialized.
    pub uptime_ms: u64,
    pub debug_mode: bool,
}

impl ClientDiagnostics {
    /// Containers that ended in `failed` or `partial`.
    pub fn unhealthy_containers(&self) -> Vec<&str> {
        self.script_states
            .iter()
            .filter(|state| {
                matches!(
                    state.status,
                    tagpilot_core::ScriptStatus::Failed | tagpilot_core::ScriptStatus::Partial
                )
            })
            .map(|state| state.container_id.as_str())
            .collect()
    }
}
