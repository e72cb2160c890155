//! Local state persistence for the ECM agent.
//!
//! This module provides SQLite-based storage for plugin records: one row per
//! installed plugin, keyed by plugin name. The startup sequencer replays the
//! rows of each ECU in insertion order.

mod store;

pub use store::{PluginRecord, PluginStore, StoreError};
