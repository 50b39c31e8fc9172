//! Identifier validation at the configuration boundary.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::ConfigurationError;

static CONTAINER_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^GTM-[A-Z0-9]{1,12}$").expect("Invalid container id regex"));

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("Invalid identifier regex")
});

/// Words that cannot name a global binding in the host language.
const RESERVED_WORDS: &[&str] = &[
    "arguments", "await", "break", "case", "catch", "class", "const", "continue", "debugger",
    "default", "delete", "do", "else", "enum", "eval", "export", "extends", "false", "finally",
    "for", "function", "if", "implements", "import", "in", "instanceof", "interface", "let",
    "new", "null", "package", "private", "protected", "public", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "undefined", "var", "void", "while",
    "with", "yield", "NaN", "Infinity",
];

pub fn is_valid_container_id(id: &str) -> bool {
    CONTAINER_ID_REGEX.is_match(id)
}

pub fn validate_container_id(id: &str) -> Result<(), ConfigurationError> {
    if is_valid_container_id(id) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidContainerId(id.to_string()))
    }
}

pub fn validate_data_layer_name(name: &str) -> Result<(), ConfigurationError> {
    if IDENTIFIER_REGEX.is_match(name) && !RESERVED_WORDS.contains(&name) {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidDataLayerName(name.to_string()))
    }
}

/// Hosts must be absolute http(s) URLs.
pub fn validate_host(host: &str) -> Result<(), ConfigurationError> {
    let trimmed = host.trim();
    let valid = (trimmed.starts_with("https://") || trimmed.starts_with("http://"))
        && trimmed.len() > "https://".len()
        && !trimmed.contains(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidHost(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_ids() {
        assert!(is_valid_container_id("GTM-ABC123"));
        assert!(is_valid_container_id("GTM-K9QWERT"));
        assert!(!is_valid_container_id("gtm-abc123"));
        assert!(!is_valid_container_id("GTM-"));
        assert!(!is_valid_container_id("UA-12345-1"));
        assert!(!is_valid_container_id("GTM-ABC 123"));
        assert_eq!(
            validate_container_id("bogus"),
            Err(ConfigurationError::InvalidContainerId("bogus".into()))
        );
    }

    #[test]
    fn test_data_layer_names() {
        assert!(validate_data_layer_name("dataLayer").is_ok());
        assert!(validate_data_layer_name("_dl$2").is_ok());
        assert!(validate_data_layer_name("2fast").is_err());
        assert!(validate_data_layer_name("data-layer").is_err());
        assert!(validate_data_layer_name("").is_err());
        let err = validate_data_layer_name("class").unwrap_err();
        assert!(err.to_string().contains("\"class\""));
    }

    #[test]
    fn test_hosts() {
        assert!(validate_host("https://www.googletagmanager.com").is_ok());
        assert!(validate_host("http://localhost:8080/").is_ok());
        assert!(validate_host("ftp://example.com").is_err());
        assert!(validate_host("https://").is_err());
    }
}
