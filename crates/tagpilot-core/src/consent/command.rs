//! Consent command construction and signatures.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use std::str::FromStr;

use super::{normalize_consent_state, ConsentState};
use crate::canonical::to_canonical_string;
use crate::error::{describe, ValidationError};
use crate::options::ConsentPolicy;

/// First element of every consent protocol entry.
pub const CONSENT_ENTRY_TAG: &str = "consent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Default,
    Update,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Default => "default",
            CommandKind::Update => "update",
        }
    }
}

impl FromStr for CommandKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(CommandKind::Default),
            "update" => Ok(CommandKind::Update),
            other => Err(ValidationError::UnsupportedCommandKind(other.to_string())),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional consent command metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsentOptions {
    /// ISO region codes the command applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Vec<String>>,
    /// Milliseconds the vendor runtime waits for an update before firing tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_update_ms: Option<f64>,
}

impl ConsentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region<I, S>(mut self, region: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.region = Some(region.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_wait_for_update_ms(mut self, wait_for_update_ms: f64) -> Self {
        self.wait_for_update_ms = Some(wait_for_update_ms);
        self
    }

    /// Parse options from JSON such as `{"region": ["US-CA"], "wait_for_update": 500}`.
    ///
    /// Shape problems are reported here; value ranges are checked by
    /// [`build_consent_command`].
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::NotAnObject(describe(value)));
        };
        let mut options = Self::default();

        if let Some(region) = map.get("region") {
            let Value::Array(items) = region else {
                return Err(ValidationError::InvalidRegion(format!(
                    "expected an array of strings, got {}",
                    describe(region)
                )));
            };
            let mut codes = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => codes.push(s.clone()),
                    other => {
                        return Err(ValidationError::InvalidRegion(format!(
                            "expected string entries, got {}",
                            describe(other)
                        )))
                    }
                }
            }
            options.region = Some(codes);
        }

        if let Some(wait) = map.get("wait_for_update") {
            let Some(ms) = wait.as_f64() else {
                return Err(ValidationError::InvalidWaitForUpdate(format!(
                    "expected a number, got {}",
                    describe(wait)
                )));
            };
            options.wait_for_update_ms = Some(ms);
        }

        Ok(options)
    }

    fn is_empty(&self) -> bool {
        self.region.is_none() && self.wait_for_update_ms.is_none()
    }

    /// Wire form of the options, `None` when there are none.
    fn to_value(&self) -> Option<Value> {
        if self.is_empty() {
            return None;
        }
        let mut options = Map::new();
        if let Some(region) = &self.region {
            options.insert(
                "region".to_string(),
                Value::Array(region.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(ms) = self.wait_for_update_ms {
            options.insert("wait_for_update".to_string(), wait_value(ms));
        }
        Some(Value::Object(options))
    }
}

/// A validated consent command ready to be written to the data layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsentCommand {
    kind: CommandKind,
    state: ConsentState,
    options: ConsentOptions,
}

impl ConsentCommand {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn state(&self) -> &ConsentState {
        &self.state
    }

    pub fn options(&self) -> &ConsentOptions {
        &self.options
    }

    /// Wire form: `["consent", kind, state]` or `["consent", kind, state, options]`.
    pub fn to_entry(&self) -> Value {
        let mut entry = vec![
            Value::String(CONSENT_ENTRY_TAG.to_string()),
            Value::String(self.kind.as_str().to_string()),
            self.state.to_value(),
        ];

        if let Some(options) = self.options.to_value() {
            entry.push(options);
        }

        Value::Array(entry)
    }

    /// Deduplication key. Recomputed on demand, never stored in the data layer.
    pub fn signature(&self) -> String {
        // to_entry always yields a tagged consent array
        signature_of_entry(&self.to_entry()).unwrap_or_default()
    }
}

/// Whole milliseconds render as integers so equal waits sign equally.
fn wait_value(ms: f64) -> Value {
    if ms.fract() == 0.0 && ms >= 0.0 && ms <= u64::MAX as f64 {
        Value::Number(Number::from(ms as u64))
    } else {
        Number::from_f64(ms).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Validate and build a consent command.
///
/// Region lists must hold non-empty strings; an empty list is dropped.
/// `wait_for_update_ms` must be finite and non-negative (zero means no wait);
/// values above the policy threshold only produce a warning.
pub fn build_consent_command(
    kind: CommandKind,
    state: ConsentState,
    options: Option<ConsentOptions>,
    policy: &ConsentPolicy,
) -> Result<ConsentCommand, ValidationError> {
    let mut options = options.unwrap_or_default();

    if let Some(region) = &options.region {
        if let Some(pos) = region.iter().position(|code| code.trim().is_empty()) {
            return Err(ValidationError::InvalidRegion(format!(
                "region[{}] must be a non-empty string",
                pos
            )));
        }
        if region.is_empty() {
            options.region = None;
        }
    }

    if let Some(ms) = options.wait_for_update_ms {
        if !ms.is_finite() {
            return Err(ValidationError::InvalidWaitForUpdate(format!(
                "must be a finite number, got {}",
                ms
            )));
        }
        if ms < 0.0 {
            return Err(ValidationError::InvalidWaitForUpdate(format!(
                "must not be negative, got {}",
                ms
            )));
        }
        if ms > policy.max_wait_for_update_ms {
            tracing::warn!(
                wait_for_update_ms = ms,
                threshold_ms = policy.max_wait_for_update_ms,
                kind = %kind,
                "consent wait_for_update is unusually long"
            );
        }
    }

    Ok(ConsentCommand {
        kind,
        state,
        options,
    })
}

/// True when `entry` looks like a consent protocol entry.
pub fn is_consent_entry(entry: &Value) -> bool {
    matches!(
        entry.as_array().and_then(|items| items.first()),
        Some(Value::String(tag)) if tag == CONSENT_ENTRY_TAG
    )
}

/// Signature of a consent entry already present in a data layer.
///
/// Returns `None` for anything that is not a well-formed consent entry
/// (unknown kind, invalid state), so foreign entries never collide with
/// commands built here.
pub fn signature_of_entry(entry: &Value) -> Option<String> {
    if !is_consent_entry(entry) {
        return None;
    }
    let items = entry.as_array()?;
    let kind = CommandKind::from_str(items.get(1)?.as_str()?).ok()?;
    let state = normalize_consent_state(items.get(2)?).ok()?;

    let mut canonical = vec![
        Value::String(CONSENT_ENTRY_TAG.to_string()),
        Value::String(kind.as_str().to_string()),
        state.to_value(),
    ];
    if let Some(raw) = items.get(3) {
        if let Some(map) = raw.as_object().filter(|map| !map.is_empty()) {
            // known option keys are signed in the same form built commands use
            let known = map
                .keys()
                .all(|key| key == "region" || key == "wait_for_update");
            let normalized = ConsentOptions::from_value(raw)
                .ok()
                .filter(|_| known)
                .and_then(|options| options.to_value());
            canonical.push(normalized.unwrap_or_else(|| raw.clone()));
        }
    }
    Some(to_canonical_string(&Value::Array(canonical)))
}
