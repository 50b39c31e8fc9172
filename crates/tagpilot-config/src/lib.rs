//! # Tagpilot Config
//!
//! Single-file configuration for a tagpilot client. A `tagpilot.yaml`
//! configures containers, the data layer, retry and verification policy,
//! consent policy, and observability settings.

mod loader;

pub use loader::{load_config, parse_config, ConfigError};

use serde::Deserialize;
use std::collections::BTreeMap;

/// Top-level configuration schema.
#[derive(Debug, Clone, Deserialize)]
pub struct TagpilotConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for TagpilotConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            client: ClientConfig::default(),
            retry: RetryConfig::default(),
            verification: VerificationConfig::default(),
            consent: ConsentConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// A container given either as a bare id or with query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ContainerSpec {
    Id(String),
    Detailed {
        id: String,
        #[serde(default)]
        query_params: BTreeMap<String, String>,
    },
}

impl ContainerSpec {
    pub fn id(&self) -> &str {
        match self {
            ContainerSpec::Id(id) => id,
            ContainerSpec::Detailed { id, .. } => id,
        }
    }

    pub fn query_params(&self) -> Vec<(String, String)> {
        match self {
            ContainerSpec::Id(_) => Vec::new(),
            ContainerSpec::Detailed { query_params, .. } => query_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default = "default_data_layer_name")]
    pub data_layer_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub script_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub noscript_attributes: BTreeMap<String, String>,
    /// 0 disables trimming.
    #[serde(default)]
    pub max_data_layer_size: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            containers: Vec::new(),
            data_layer_name: default_data_layer_name(),
            host: default_host(),
            script_attributes: BTreeMap::new(),
            noscript_attributes: BTreeMap::new(),
            max_data_layer_size: 0,
            debug: false,
        }
    }
}

fn default_data_layer_name() -> String {
    "dataLayer".to_string()
}

fn default_host() -> String {
    "https://www.googletagmanager.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt load timeout; unset disables it.
    #[serde(default)]
    pub load_timeout_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay_ms: default_retry_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            load_timeout_ms: None,
        }
    }
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initialization_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: default_initialization_timeout_ms(),
        }
    }
}

fn default_initialization_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsentConfig {
    /// Warn when a consent command asks the runtime to wait longer than this.
    #[serde(default = "default_max_wait_for_update_ms")]
    pub max_wait_for_update_ms: f64,
    /// Remember only the last N delivered signatures; unset means whole session.
    #[serde(default)]
    pub dedupe_window: Option<usize>,
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            max_wait_for_update_ms: default_max_wait_for_update_ms(),
            dedupe_window: None,
        }
    }
}

fn default_max_wait_for_update_ms() -> f64 {
    1_800_000.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
