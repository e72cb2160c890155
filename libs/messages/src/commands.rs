//! Commands sent to ECUs and the acknowledgments they return.

use serde::{Deserialize, Serialize};

use crate::binary::PluginBinary;
use crate::ids::{EcuId, OperationId, PortId};
use crate::packets::{LinkContextEntry, PortInitialContext};

/// Command delivered to the ECU named by `reference`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EcuCommand {
    /// Install a new plugin. Answered by `EcuAck::InstallAck` with the same id.
    Install {
        reference: EcuId,
        plugin_id: OperationId,
        executable_plugin_name: String,
        callback_port_id: PortId,
        port_initial_context: PortInitialContext,
        port_linking_context: Vec<LinkContextEntry>,
        binary: PluginBinary,
    },

    /// Remove an installed plugin. Answered by `EcuAck::UninstallAck`.
    Uninstall {
        reference: EcuId,
        plugin_id: OperationId,
        plugin_name: String,
        callback_port_id: PortId,
    },

    /// Reinstate a plugin from a server-side backup.
    Restore {
        reference: EcuId,
        plugin_name: String,
        callback_port_id: PortId,
        port_initial_context: PortInitialContext,
        binary: PluginBinary,
    },

    /// Load an already-installed plugin after the ECU boots.
    Load {
        reference: EcuId,
        executable_plugin_name: String,
        callback_port_id: PortId,
        port_initial_context: PortInitialContext,
        port_linking_context: Vec<LinkContextEntry>,
        binary: PluginBinary,
    },

    /// Power control output.
    Power { reference: EcuId, value: i32 },
}

impl EcuCommand {
    /// The ECU this command is addressed to.
    pub fn reference(&self) -> EcuId {
        match self {
            Self::Install { reference, .. }
            | Self::Uninstall { reference, .. }
            | Self::Restore { reference, .. }
            | Self::Load { reference, .. }
            | Self::Power { reference, .. } => *reference,
        }
    }

    /// Short name of the command kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Install { .. } => "install",
            Self::Uninstall { .. } => "uninstall",
            Self::Restore { .. } => "restore",
            Self::Load { .. } => "load",
            Self::Power { .. } => "power",
        }
    }
}

/// Messages produced by ECUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EcuAck {
    /// The install identified by `plugin_id` completed.
    InstallAck {
        plugin_id: OperationId,
        #[serde(default)]
        plugin_name: Option<String>,
    },

    /// An uninstall completed. At least one of the fields identifies it.
    UninstallAck {
        #[serde(default)]
        plugin_id: Option<OperationId>,
        #[serde(default)]
        plugin_name: Option<String>,
    },

    /// A restore completed.
    RestoreAck { plugin_name: String },

    /// A load issued at startup completed.
    LoadAck { plugin_name: String },

    /// A plugin published a telemetry value.
    Publish { key: String, value: String },

    /// Free-form message originated by a plugin.
    PluginMessage {
        #[serde(default)]
        payload: String,
    },
}

impl EcuAck {
    /// Short name of the acknowledgment kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InstallAck { .. } => "install_ack",
            Self::UninstallAck { .. } => "uninstall_ack",
            Self::RestoreAck { .. } => "restore_ack",
            Self::LoadAck { .. } => "load_ack",
            Self::Publish { .. } => "publish",
            Self::PluginMessage { .. } => "plugin_message",
        }
    }
}

/// Frames an ECU sends over its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum EcuFrame {
    /// First frame of a session.
    Hello { ecu_id: EcuId },

    /// Any acknowledgment or plugin-originated message.
    Ack(EcuAck),
}
