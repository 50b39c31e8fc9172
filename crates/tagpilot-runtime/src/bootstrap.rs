//! Bootstrap helpers: tracing setup and config-file driven construction.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;

use tagpilot_config::{load_config, ConfigError, ObservabilityConfig, TagpilotConfig};
use tagpilot_core::host::{Document, GlobalScope};
use tagpilot_core::{
    ClientError, ClientOptions, ConsentPolicy, ContainerDescriptor, RetryPolicy,
};

use crate::client::TagClient;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Errors building a client from a config file.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Install a global `fmt` subscriber once per process.
///
/// `RUST_LOG` overrides the configured level; `TAGPILOT_LOG_FILE` overrides
/// the configured log file. A subscriber installed elsewhere is left alone.
pub fn init_tracing(observability: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let log_file_path = std::env::var("TAGPILOT_LOG_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| observability.log_file.clone());
        let file_writer = log_file_path.as_deref().and_then(create_log_writer);
        let fallback_level = match observability.log_level.trim().to_ascii_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        };

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(fallback_level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        match file_writer {
            Some(writer) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(writer)
                    .try_init();
            }
            None => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(true)
                    .try_init();
            }
        }

        tracing::info!(
            log_level = %observability.log_level,
            log_file = log_file_path.as_deref().unwrap_or("(stdout)"),
            "tracing initialized"
        );
    });
}

fn create_log_writer(path: &str) -> Option<Arc<std::fs::File>> {
    use std::fs::{create_dir_all, OpenOptions};

    let file_path = Path::new(path);
    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = create_dir_all(parent) {
                eprintln!(
                    "failed to create log directory '{}': {}",
                    parent.display(),
                    err
                );
                return None;
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(file_path) {
        Ok(file) => Some(Arc::new(file)),
        Err(err) => {
            eprintln!("failed to open log file '{}': {}", file_path.display(), err);
            None
        }
    }
}

/// Map a loaded config onto programmatic client options.
pub fn client_options_from_config(config: &TagpilotConfig) -> ClientOptions {
    let client = &config.client;
    let containers = client.containers.iter().map(|spec| {
        spec.query_params()
            .into_iter()
            .fold(ContainerDescriptor::new(spec.id()), |descriptor, (key, value)| {
                descriptor.with_query_param(key, value)
            })
    });

    let retry = RetryPolicy::new(
        config.retry.attempts,
        Duration::from_millis(config.retry.delay_ms),
    )
    .with_max_delay(Duration::from_millis(config.retry.max_delay_ms));

    let mut options = ClientOptions::new(containers)
        .with_data_layer_name(client.data_layer_name.clone())
        .with_host(client.host.clone())
        .with_retry(retry)
        .with_max_data_layer_size(client.max_data_layer_size)
        .with_consent_policy(ConsentPolicy {
            max_wait_for_update_ms: config.consent.max_wait_for_update_ms,
            dedupe_window: config.consent.dedupe_window,
        })
        .with_debug(client.debug);

    for (key, value) in &client.script_attributes {
        options = options.with_script_attribute(key.clone(), value.clone());
    }
    options.noscript_attributes = client
        .noscript_attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(ms) = config.retry.load_timeout_ms {
        options = options.with_load_timeout(Duration::from_millis(ms));
    }
    if config.verification.enabled {
        options =
            options.with_initialization_check(Duration::from_millis(config.verification.timeout_ms));
    }
    options
}

/// Load `path`, initialise tracing from it and build a client.
pub fn client_from_config_file(
    path: &Path,
    scope: Arc<dyn GlobalScope>,
    document: Arc<dyn Document>,
) -> Result<TagClient, BootstrapError> {
    let config = load_config(path)?;
    init_tracing(&config.observability);
    let client = TagClient::new(client_options_from_config(&config), scope, document)?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tagpilot_config::parse_config;
    use tagpilot_stores::{InMemoryDocument, InMemoryWindow};

    #[test]
    fn test_options_from_config() {
        let config = parse_config(
            r#"
client:
  containers:
    - GTM-ABC123
    - id: GTM-DEF456
      query_params:
        gtm_auth: secret
  data_layer_name: appLayer
  script_attributes:
    nonce: n0nce
  noscript_attributes:
    title: tag manager
  max_data_layer_size: 100
  debug: true
retry:
  attempts: 3
  delay_ms: 250
  max_delay_ms: 2000
  load_timeout_ms: 8000
verification:
  enabled: true
  timeout_ms: 1500
consent:
  max_wait_for_update_ms: 60000
  dedupe_window: 10
"#,
        )
        .unwrap();

        let options = client_options_from_config(&config);
        assert_eq!(options.containers.len(), 2);
        assert_eq!(
            options.containers[1].query_params,
            vec![("gtm_auth".to_string(), "secret".to_string())]
        );
        assert_eq!(options.data_layer_name, "appLayer");
        assert_eq!(options.script_attributes, vec![("nonce".to_string(), "n0nce".to_string())]);
        assert_eq!(options.noscript_attributes.len(), 1);
        assert_eq!(options.retry.attempts, 3);
        assert_eq!(options.retry.backoff(0), Duration::from_millis(250));
        assert_eq!(options.retry.backoff(5), Duration::from_millis(2_000));
        assert_eq!(options.load_timeout, Some(Duration::from_millis(8_000)));
        assert!(options.verify_initialization);
        assert_eq!(options.initialization_timeout, Duration::from_millis(1_500));
        assert_eq!(options.max_data_layer_size, 100);
        assert_eq!(options.consent.dedupe_window, Some(10));
        assert!(options.debug);
    }

    #[test]
    fn test_verification_disabled_by_default() {
        let config = parse_config("client:\n  containers: [GTM-ABC123]\n").unwrap();
        let options = client_options_from_config(&config);
        assert!(!options.verify_initialization);
        assert_eq!(options.load_timeout, None);
        assert_eq!(options.data_layer_name, "dataLayer");
    }

    #[test]
    fn test_client_from_config_file() {
        let path = std::env::temp_dir().join(format!(
            "tagpilot-bootstrap-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "client:\n  containers: [GTM-ABC123]\n  data_layer_name: bootstrapLayer\nobservability:\n  log_level: warn\n",
        )
        .unwrap();

        let client = client_from_config_file(
            &path,
            Arc::new(InMemoryWindow::new()),
            Arc::new(InMemoryDocument::new()),
        )
        .unwrap();
        assert_eq!(client.data_layer_name(), "bootstrapLayer");
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            client_from_config_file(
                &path,
                Arc::new(InMemoryWindow::new()),
                Arc::new(InMemoryDocument::new()),
            ),
            Err(BootstrapError::Config(ConfigError::Io(_)))
        ));
    }

    #[test]
    fn test_invalid_container_in_config_is_a_client_error() {
        let config = parse_config("client:\n  containers: [not-a-container]\n").unwrap();
        let result = TagClient::new(
            client_options_from_config(&config),
            Arc::new(InMemoryWindow::new()),
            Arc::new(InMemoryDocument::new()),
        );
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }
}
