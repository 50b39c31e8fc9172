//! Process-wide count of initialized clients per data layer name.
//!
//! Two clients on the same data layer are allowed but usually a mistake;
//! the client warns when it is not alone.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

static INSTANCES: LazyLock<Mutex<HashMap<String, usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn instances() -> MutexGuard<'static, HashMap<String, usize>> {
    INSTANCES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Record one more active client on `data_layer_name`; returns the new count.
pub(crate) fn acquire(data_layer_name: &str) -> usize {
    let mut instances = instances();
    let count = instances.entry(data_layer_name.to_string()).or_insert(0);
    *count += 1;
    *count
}

/// Drop one active client; returns how many remain.
pub(crate) fn release(data_layer_name: &str) -> usize {
    let mut instances = instances();
    let Some(count) = instances.get_mut(data_layer_name) else {
        return 0;
    };
    *count = count.saturating_sub(1);
    let remaining = *count;
    if remaining == 0 {
        instances.remove(data_layer_name);
    }
    remaining
}

/// Number of initialized clients currently bound to `data_layer_name`.
pub fn active_instances(data_layer_name: &str) -> usize {
    instances().get(data_layer_name).copied().unwrap_or(0)
}
