//! # Tagpilot Stores
//!
//! Minimal host implementations for the tagpilot engine.
//!
//! This crate provides:
//! - InMemory GlobalScope (`InMemoryWindow`)
//! - InMemory Document (`InMemoryDocument`) with load / error / unload dispatch
//!
//! They back tests and server-side rendering; a browser build supplies its
//! own implementations of the same traits.

mod document;
mod window;

pub use document::{InMemoryDocument, InsertionPoint, ScriptRecord};
pub use window::InMemoryWindow;

// Re-export core traits for convenience
pub use tagpilot_core::host::{
    DataLayerArray, Document, ElementId, GlobalScope, GlobalValue, ListenerId, ScriptHandlers,
    ScriptSpec,
};
