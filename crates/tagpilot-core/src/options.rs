//! Programmatic client options.
//!
//! `tagpilot-config` deserializes the YAML form; the runtime bootstrap maps
//! it onto these types.

use std::time::Duration;

use crate::types::ContainerDescriptor;
use crate::{DEFAULT_DATA_LAYER_NAME, DEFAULT_HOST, DEFAULT_INITIALIZATION_TIMEOUT};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1_000);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_WAIT_FOR_UPDATE_MS: f64 = 30.0 * 60.0 * 1_000.0;

/// Script load retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub attempts: u32,
    /// Base delay; attempt n waits `min(delay * 2^n, max_delay)`.
    pub delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay: DEFAULT_RETRY_DELAY,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.delay);
        self
    }

    /// Delay before retry number `retries_used + 1`.
    pub fn backoff(&self, retries_used: u32) -> Duration {
        let base_ms = self.delay.as_millis();
        if base_ms == 0 {
            return Duration::from_millis(0);
        }
        let max_ms = self.max_delay.as_millis().max(base_ms);
        let shift = retries_used.min(20);
        let multiplier = 1u128 << shift;
        let backoff_ms = base_ms.saturating_mul(multiplier).min(max_ms);
        let millis = u64::try_from(backoff_ms).unwrap_or(u64::MAX);
        Duration::from_millis(millis)
    }
}

/// Consent handling knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsentPolicy {
    /// `wait_for_update` above this only logs a warning.
    pub max_wait_for_update_ms: f64,
    /// How many delivered signatures are remembered for deduplication.
    /// `None` remembers the whole session.
    pub dedupe_window: Option<usize>,
}

impl Default for ConsentPolicy {
    fn default() -> Self {
        Self {
            max_wait_for_update_ms: DEFAULT_MAX_WAIT_FOR_UPDATE_MS,
            dedupe_window: None,
        }
    }
}

/// Everything a client needs to run.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub containers: Vec<ContainerDescriptor>,
    pub data_layer_name: String,
    pub host: String,
    /// Extra attributes set on injected script elements (e.g. `nonce`).
    pub script_attributes: Vec<(String, String)>,
    /// Overrides for the noscript iframe attributes.
    pub noscript_attributes: Vec<(String, String)>,
    pub retry: RetryPolicy,
    /// Treat a script with no load/error signal within this time as failed.
    pub load_timeout: Option<Duration>,
    pub verify_initialization: bool,
    pub initialization_timeout: Duration,
    /// Trim the data layer above this many entries; 0 disables trimming.
    pub max_data_layer_size: usize,
    pub consent: ConsentPolicy,
    pub debug: bool,
}

impl ClientOptions {
    pub fn new<I, C>(containers: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ContainerDescriptor>,
    {
        Self {
            containers: containers.into_iter().map(Into::into).collect(),
            data_layer_name: DEFAULT_DATA_LAYER_NAME.to_string(),
            host: DEFAULT_HOST.to_string(),
            script_attributes: Vec::new(),
            noscript_attributes: Vec::new(),
            retry: RetryPolicy::default(),
            load_timeout: None,
            verify_initialization: false,
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
            max_data_layer_size: 0,
            consent: ConsentPolicy::default(),
            debug: false,
        }
    }

    pub fn with_data_layer_name(mut self, name: impl Into<String>) -> Self {
        self.data_layer_name = name.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_script_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.script_attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = Some(timeout);
        self
    }

    pub fn with_initialization_check(mut self, timeout: Duration) -> Self {
        self.verify_initialization = true;
        self.initialization_timeout = timeout;
        self
    }

    pub fn with_max_data_layer_size(mut self, max: usize) -> Self {
        self.max_data_layer_size = max;
        self
    }

    pub fn with_consent_policy(mut self, consent: ConsentPolicy) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
