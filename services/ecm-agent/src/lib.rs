//! ECM agent library.
//!
//! The agent runs on the vehicle and brokers plugin lifecycle operations
//! between the trusted server, the ECUs that execute plugins, and the IoT
//! collection endpoint.
//!
//! ## Architecture
//!
//! ```text
//! trusted server ──▶ uplink ──▶ unpack worker ──┐
//!                                              ▼
//! ECU sessions ──── acks ───────────────▶ CoordinatorActor ──▶ ECU sessions
//!                                              │
//!                     trusted server ◀─────────┴────────▶ IoT endpoint
//! ```
//!
//! ## Modules
//!
//! - `actors`: actor framework, coordinator actor and root supervisor
//! - `coordinator`: message router and operation tracking
//! - `ecu`, `uplink`, `telemetry`: network sessions
//! - `unpack`: batch packet splitting
//! - `startup`: replay of installed plugins
//! - `state`: local SQLite plugin records

pub mod actors;
pub mod agent;
pub mod config;
pub mod coordinator;
pub mod ecu;
pub mod files;
pub mod gateway;
pub mod operations;
pub mod startup;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod unpack;
pub mod uplink;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorError, Inbound};
pub use gateway::{MockEcuGateway, MockTelemetryChannel, MockTrustedChannel};
