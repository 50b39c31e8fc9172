//! # Tagpilot Runtime
//!
//! Stateful engine built on `tagpilot-core`.
//!
//! This crate contains:
//! - ScriptManager (inject / retry / timeout / verify / unload)
//! - TagClient (queueing, flush ordering, consent dedup, teardown)
//! - Script hooks, readiness subscriptions and diagnostics
//! - Tracing and config-file bootstrap
//!
//! Host implementations live in `tagpilot-stores` or in the embedding
//! application.

pub mod bootstrap;
mod client;
mod diagnostics;
mod hooks;
mod readiness;
mod registry;
mod script_manager;

pub use bootstrap::{
    client_from_config_file, client_options_from_config, init_tracing, BootstrapError,
};
pub use client::TagClient;
pub use diagnostics::ClientDiagnostics;
pub use hooks::{HookRegistry, ScriptHook};
pub use readiness::{ReadyCallback, ReadySubscription};
pub use registry::active_instances;
pub use script_manager::{ScriptManager, ScriptSettings};
