//! Packets exchanged with the trusted server and the IoT endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::binary::PluginBinary;
use crate::ids::{AppId, EcuId, PortId};

/// Initial value per logical port name, established at install time.
pub type PortInitialContext = BTreeMap<String, i32>;

/// One inter-plugin port connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkContextEntry {
    /// Port on the installing plugin.
    pub from_port_id: PortId,
    /// ECU hosting the target plugin.
    pub remote_ecu_id: EcuId,
    /// Port on the target plugin.
    pub to_port_id: PortId,
}

/// One plugin inside an install or restore batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallEntry {
    pub app_id: AppId,
    pub reference: EcuId,
    pub sending_port_id: PortId,
    pub callback_port_id: PortId,
    pub plugin_name: String,
    pub executable_plugin_name: String,
    #[serde(default)]
    pub port_initial_context: PortInitialContext,
    /// Mandatory for installs. Kept optional on the wire so a missing value
    /// surfaces as a validation error instead of a decode failure of the
    /// whole batch.
    #[serde(default)]
    pub port_linking_context: Option<Vec<LinkContextEntry>>,
    pub binary: PluginBinary,
}

/// One plugin inside an uninstall batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UninstallEntry {
    pub plugin_name: String,
    pub callback_port_id: PortId,
    pub reference: EcuId,
}

/// Packets on the trusted-server link.
///
/// `Install`, `Uninstall` and `Restore` arrive from the server; the remaining
/// variants are sent by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPacket {
    /// Batch install request.
    Install { entries: Vec<InstallEntry> },

    /// Batch uninstall request.
    Uninstall { entries: Vec<UninstallEntry> },

    /// Batch restore request.
    Restore { entries: Vec<InstallEntry> },

    /// First packet of every session, identifying the vehicle.
    Init { vin: String },

    /// The plugin binary reached the vehicle (sent before the ECU answers).
    InstallLinuxAck { vin: String, plugin_name: String },

    /// The ECU installed the plugin.
    InstallAck {
        vin: String,
        app_id: AppId,
        plugin_name: String,
    },

    /// The ECU removed the plugin.
    UninstallAck { vin: String, plugin_name: String },

    /// The ECU restored the plugin.
    RestoreAck { vin: String, plugin_name: String },
}

impl ServerPacket {
    /// Short name of the packet kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Uninstall { .. } => "uninstall",
            Self::Restore { .. } => "restore",
            Self::Init { .. } => "init",
            Self::InstallLinuxAck { .. } => "install_linux_ack",
            Self::InstallAck { .. } => "install_ack",
            Self::UninstallAck { .. } => "uninstall_ack",
            Self::RestoreAck { .. } => "restore_ack",
        }
    }
}

/// Packets on the IoT link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IotPacket {
    /// Key/value telemetry published by a plugin.
    Publish { key: String, value: String },
}
