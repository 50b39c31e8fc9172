//! Data layer entry classification and trimming.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::consent::is_consent_entry;

/// Event name of the start marker.
pub const START_EVENT: &str = "gtm.js";

/// Vendor-defined start timestamp field on the start marker.
pub const START_TIMESTAMP_FIELD: &str = "gtm.start";

/// Start marker stamped with the current time.
pub fn start_marker() -> Value {
    start_marker_at(Utc::now().timestamp_millis())
}

pub fn start_marker_at(timestamp_ms: i64) -> Value {
    let mut marker = Map::new();
    marker.insert(START_TIMESTAMP_FIELD.to_string(), json!(timestamp_ms));
    marker.insert("event".to_string(), json!(START_EVENT));
    Value::Object(marker)
}

pub fn is_start_marker(entry: &Value) -> bool {
    let Value::Object(map) = entry else {
        return false;
    };
    map.get("event").and_then(Value::as_str) == Some(START_EVENT)
        && map.contains_key(START_TIMESTAMP_FIELD)
}

/// Drop the oldest non-critical entries until `entries.len() <= max_size`.
///
/// Critical entries are the first start marker and every consent entry; they
/// are never removed, so the result may still exceed `max_size` when they
/// alone are too many. Relative order of retained entries is preserved.
/// `max_size == 0` disables trimming. Returns the number of removed entries.
pub fn trim_entries(entries: &mut Vec<Value>, max_size: usize) -> usize {
    if max_size == 0 || entries.len() <= max_size {
        return 0;
    }

    let before = entries.len();
    let mut excess = before - max_size;
    let marker_index = entries.iter().position(is_start_marker);
    let mut index = 0usize;

    entries.retain(|entry| {
        let current = index;
        index += 1;
        if excess == 0 {
            return true;
        }
        if Some(current) == marker_index || is_consent_entry(entry) {
            return true;
        }
        excess -= 1;
        false
    });

    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> Value {
        json!({"event": "custom", "n": n})
    }

    #[test]
    fn test_start_marker_shape() {
        let marker = start_marker_at(42);
        assert!(is_start_marker(&marker));
        assert_eq!(marker["gtm.start"], 42);
        assert!(!is_start_marker(&json!({"event": "gtm.js"})));
        assert!(!is_start_marker(&json!(["gtm.js"])));
    }

    #[test]
    fn test_trim_keeps_newest_and_critical() {
        let consent = json!(["consent", "default", {"ad_storage": "denied"}]);
        let mut entries = vec![
            start_marker_at(1),
            event(1),
            consent.clone(),
            event(2),
            event(3),
            event(4),
        ];
        let removed = trim_entries(&mut entries, 4);
        assert_eq!(removed, 2);
        assert_eq!(entries, vec![start_marker_at(1), consent, event(3), event(4)]);
    }

    #[test]
    fn test_trim_disabled_for_zero() {
        let mut entries = vec![event(1), event(2)];
        assert_eq!(trim_entries(&mut entries, 0), 0);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_trim_cannot_remove_critical_entries() {
        let mut entries = vec![
            start_marker_at(1),
            json!(["consent", "default", {"ad_storage": "denied"}]),
            json!(["consent", "update", {"ad_storage": "granted"}]),
            event(1),
        ];
        let removed = trim_entries(&mut entries, 2);
        assert_eq!(removed, 1);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| is_start_marker(e) || is_consent_entry(e)));
    }

    #[test]
    fn test_only_first_start_marker_is_critical() {
        let mut entries = vec![start_marker_at(1), start_marker_at(2), event(1)];
        trim_entries(&mut entries, 2);
        assert_eq!(entries, vec![start_marker_at(1), event(1)]);
    }
}
