//! # ecm-messages
//!
//! Message vocabularies spoken by the ECM agent.
//!
//! ## Vocabularies
//!
//! The agent translates between three independent vocabularies:
//! - Trusted-server packets (`ServerPacket`): batched install/uninstall/restore
//!   requests in, acknowledgments out
//! - ECU commands and acknowledgments (`EcuCommand`, `EcuAck`)
//! - Telemetry packets (`IotPacket`) relayed to the IoT endpoint
//!
//! ## Framing
//!
//! Every link carries newline-delimited JSON, one tagged object per line.
//! Plugin binaries are base64-encoded inside the JSON body.

mod base64_bytes;
mod binary;
mod commands;
mod error;
mod frame;
mod ids;
mod naming;
mod packets;

pub use binary::PluginBinary;
pub use commands::*;
pub use error::MessageError;
pub use frame::{decode_frame, encode_frame, MAX_FRAME_BYTES};
pub use ids::*;
pub use naming::{to_server_name, SERVER_EXTENSION, STAGED_EXTENSION};
pub use packets::*;
