//! Consent protocol types.
//!
//! A consent state maps a fixed set of signal keys to `granted` / `denied`.
//! Construction is all-or-nothing: either every key and value is valid and at
//! least one key is present, or nothing is built.

mod command;

pub use command::{
    build_consent_command, is_consent_entry, signature_of_entry, CommandKind, ConsentCommand,
    ConsentOptions, CONSENT_ENTRY_TAG,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{describe, ValidationError};

/// Consent signal keys understood by the vendor runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentSignal {
    AdStorage,
    AnalyticsStorage,
    AdUserData,
    AdPersonalization,
    FunctionalityStorage,
    PersonalizationStorage,
    SecurityStorage,
}

impl ConsentSignal {
    pub const ALL: [ConsentSignal; 7] = [
        ConsentSignal::AdStorage,
        ConsentSignal::AnalyticsStorage,
        ConsentSignal::AdUserData,
        ConsentSignal::AdPersonalization,
        ConsentSignal::FunctionalityStorage,
        ConsentSignal::PersonalizationStorage,
        ConsentSignal::SecurityStorage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsentSignal::AdStorage => "ad_storage",
            ConsentSignal::AnalyticsStorage => "analytics_storage",
            ConsentSignal::AdUserData => "ad_user_data",
            ConsentSignal::AdPersonalization => "ad_personalization",
            ConsentSignal::FunctionalityStorage => "functionality_storage",
            ConsentSignal::PersonalizationStorage => "personalization_storage",
            ConsentSignal::SecurityStorage => "security_storage",
        }
    }
}

impl FromStr for ConsentSignal {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|signal| signal.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownConsentSignal(s.to_string()))
    }
}

impl fmt::Display for ConsentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentValue {
    Granted,
    Denied,
}

impl ConsentValue {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsentValue::Granted => "granted",
            ConsentValue::Denied => "denied",
        }
    }

    fn parse(signal: &str, raw: &str) -> Result<Self, ValidationError> {
        match raw {
            "granted" => Ok(ConsentValue::Granted),
            "denied" => Ok(ConsentValue::Denied),
            other => Err(ValidationError::InvalidConsentValue {
                signal: signal.to_string(),
                value: format!("{:?}", other),
            }),
        }
    }
}

/// Validated, immutable consent state.
///
/// Entries are kept in signal order, so iteration and rendering do not
/// depend on how the input was ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConsentState(BTreeMap<ConsentSignal, ConsentValue>);

impl ConsentState {
    /// Build from typed entries. Fails only when no entries are given.
    pub fn new(
        entries: impl IntoIterator<Item = (ConsentSignal, ConsentValue)>,
    ) -> Result<Self, ValidationError> {
        let map: BTreeMap<_, _> = entries.into_iter().collect();
        if map.is_empty() {
            return Err(ValidationError::EmptyConsentState);
        }
        Ok(Self(map))
    }

    /// Build from string pairs such as `("analytics_storage", "denied")`.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, ValidationError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in pairs {
            let key = key.as_ref();
            let signal = ConsentSignal::from_str(key)?;
            map.insert(signal, ConsentValue::parse(key, value.as_ref())?);
        }
        Self::new(map)
    }

    pub fn get(&self, signal: ConsentSignal) -> Option<ConsentValue> {
        self.0.get(&signal).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConsentSignal, ConsentValue)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed state; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as the wire object, e.g. `{"analytics_storage": "denied"}`.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), Value::String(v.as_str().to_string())))
            .collect();
        Value::Object(map)
    }
}

impl TryFrom<&Value> for ConsentState {
    type Error = ValidationError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        normalize_consent_state(value)
    }
}

/// Validate arbitrary JSON input into a consent state.
pub fn normalize_consent_state(input: &Value) -> Result<ConsentState, ValidationError> {
    let Value::Object(map) = input else {
        return Err(ValidationError::NotAnObject(describe(input)));
    };
    if map.is_empty() {
        return Err(ValidationError::EmptyConsentState);
    }

    let mut entries = BTreeMap::new();
    for (key, raw) in map {
        let signal = ConsentSignal::from_str(key)?;
        let value = match raw {
            Value::String(s) => ConsentValue::parse(key, s)?,
            other => {
                return Err(ValidationError::InvalidConsentValue {
                    signal: key.clone(),
                    value: describe(other),
                })
            }
        };
        entries.insert(signal, value);
    }
    ConsentState::new(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_accepts_valid_state() {
        let state =
            normalize_consent_state(&json!({"analytics_storage": "denied", "ad_storage": "granted"}))
                .unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(
            state.get(ConsentSignal::AnalyticsStorage),
            Some(ConsentValue::Denied)
        );
        // Signal order, not input order.
        let keys: Vec<_> = state.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ad_storage", "analytics_storage"]);
    }

    #[test]
    fn test_normalize_rejects_empty_state() {
        assert_eq!(
            normalize_consent_state(&json!({})),
            Err(ValidationError::EmptyConsentState)
        );
    }

    #[test]
    fn test_normalize_rejects_unknown_key_atomically() {
        let err = normalize_consent_state(&json!({"ad_storage": "granted", "cookies": "granted"}))
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownConsentSignal("cookies".into()));
    }

    #[test]
    fn test_normalize_rejects_invalid_values() {
        assert!(matches!(
            normalize_consent_state(&json!({"ad_storage": "yes"})),
            Err(ValidationError::InvalidConsentValue { .. })
        ));
        assert!(matches!(
            normalize_consent_state(&json!({"ad_storage": true})),
            Err(ValidationError::InvalidConsentValue { .. })
        ));
        assert!(matches!(
            normalize_consent_state(&json!(["ad_storage"])),
            Err(ValidationError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_from_pairs_matches_json_normalization() {
        let a = ConsentState::from_pairs([("ad_user_data", "granted"), ("ad_storage", "denied")])
            .unwrap();
        let b = normalize_consent_state(&json!({"ad_storage": "denied", "ad_user_data": "granted"}))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_value(), json!({"ad_storage": "denied", "ad_user_data": "granted"}));
    }
}
