//! Splits batch packets from the trusted server into per-plugin operations.
//!
//! Each entry is handled on its own: a failing entry is logged and abandoned
//! while its siblings continue. Identifier allocation and record tracking are
//! left to the coordinator actor.

use std::path::PathBuf;
use std::sync::Arc;

use ecm_messages::{EcuCommand, InstallEntry, ServerPacket, UninstallEntry};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::actors::{ActorError, CoordinatorHandle};
use crate::coordinator::{StagedInstall, StagedUninstall};
use crate::files::{plugin_path, FileError, PluginFiles};
use crate::gateway::TrustedChannel;
use crate::state::PluginRecord;

/// Errors that abandon a single batch entry.
#[derive(Debug, Error)]
pub enum UnpackError {
    /// An install entry arrived without its port linking context.
    #[error("install entry {plugin_name:?} has no port linking context")]
    MissingLinkContext { plugin_name: String },

    #[error(transparent)]
    File(#[from] FileError),

    /// The coordinator actor could not take the entry.
    #[error("coordinator unavailable: {0}")]
    Coordinator(#[from] ActorError),

    /// The arrival acknowledgment could not be sent upstream.
    #[error("upstream channel error: {0}")]
    Upstream(#[source] anyhow::Error),
}

/// Per-batch outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackReport {
    /// Entries handed to the coordinator.
    ///
    /// Staging itself happens later on the actor. An install the coordinator
    /// rejects there (no free identifier, ECU unreachable) is logged by the
    /// actor, and its binary is discarded unless an installed plugin still
    /// uses it. Its `InstallLinuxAck` has already gone upstream by then.
    pub staged: usize,
    /// Entries dropped after an error.
    pub abandoned: usize,
}

impl UnpackReport {
    fn record(&mut self, plugin_name: &str, result: Result<(), UnpackError>) {
        match result {
            Ok(()) => self.staged += 1,
            Err(e) => {
                warn!(plugin_name = %plugin_name, error = %e, "Abandoning batch entry");
                self.abandoned += 1;
            }
        }
    }
}

/// Unpacks inbound batches.
#[derive(Clone)]
pub struct Unpacker {
    vin: String,

    /// Directory for installed plugin binaries.
    app_dir: PathBuf,

    /// Directory for restored plugin binaries.
    restore_dir: PathBuf,

    files: PluginFiles,
    coordinator: CoordinatorHandle,
    trusted: Arc<dyn TrustedChannel>,
}

impl Unpacker {
    pub fn new(
        vin: String,
        app_dir: PathBuf,
        restore_dir: PathBuf,
        coordinator: CoordinatorHandle,
        trusted: Arc<dyn TrustedChannel>,
    ) -> Self {
        Self {
            vin,
            app_dir,
            restore_dir,
            files: PluginFiles::new(),
            coordinator,
            trusted,
        }
    }

    /// Unpack one packet. Never fails as a whole; see the report.
    pub async fn unpack(&self, packet: ServerPacket) -> UnpackReport {
        let kind = packet.kind();
        let mut report = UnpackReport::default();

        match packet {
            ServerPacket::Install { entries } => {
                info!(entries = entries.len(), "Install batch arrived");
                for entry in entries {
                    let plugin_name = entry.plugin_name.clone();
                    report.record(&plugin_name, self.unpack_install(entry).await);
                }
            }
            ServerPacket::Uninstall { entries } => {
                info!(entries = entries.len(), "Uninstall batch arrived");
                for entry in entries {
                    let plugin_name = entry.plugin_name.clone();
                    report.record(&plugin_name, self.unpack_uninstall(entry).await);
                }
            }
            ServerPacket::Restore { entries } => {
                info!(entries = entries.len(), "Restore batch arrived");
                for entry in entries {
                    let plugin_name = entry.plugin_name.clone();
                    report.record(&plugin_name, self.unpack_restore(entry).await);
                }
            }
            _ => {
                warn!(kind, "Dropping unexpected packet from trusted server");
                return report;
            }
        }

        debug!(
            kind,
            staged = report.staged,
            abandoned = report.abandoned,
            "Batch unpacked"
        );
        report
    }

    async fn unpack_install(&self, entry: InstallEntry) -> Result<(), UnpackError> {
        let InstallEntry {
            app_id,
            reference,
            sending_port_id,
            callback_port_id,
            plugin_name,
            executable_plugin_name,
            port_initial_context,
            port_linking_context,
            binary,
        } = entry;

        let port_linking_context =
            port_linking_context.ok_or_else(|| UnpackError::MissingLinkContext {
                plugin_name: plugin_name.clone(),
            })?;

        let location = plugin_path(&self.app_dir, &plugin_name)?;
        self.files.save(binary.as_bytes(), &location)?;

        self.trusted
            .send(ServerPacket::InstallLinuxAck {
                vin: self.vin.clone(),
                plugin_name: plugin_name.clone(),
            })
            .await
            .map_err(UnpackError::Upstream)?;

        let record = PluginRecord {
            app_id,
            remote_ecu_id: reference,
            plugin_name,
            executable_plugin_name,
            callback_port_id,
            sending_port_id,
            port_initial_context,
            port_linking_context,
            location,
        };

        self.coordinator
            .stage_install(StagedInstall { record, binary })
            .await?;
        Ok(())
    }

    async fn unpack_uninstall(&self, entry: UninstallEntry) -> Result<(), UnpackError> {
        let UninstallEntry {
            plugin_name,
            callback_port_id,
            reference,
        } = entry;

        self.coordinator
            .stage_uninstall(StagedUninstall {
                plugin_name,
                callback_port_id,
                reference,
            })
            .await?;
        Ok(())
    }

    async fn unpack_restore(&self, entry: InstallEntry) -> Result<(), UnpackError> {
        let location = plugin_path(&self.restore_dir, &entry.plugin_name)?;
        self.files.save(entry.binary.as_bytes(), &location)?;

        self.coordinator
            .command(EcuCommand::Restore {
                reference: entry.reference,
                plugin_name: entry.plugin_name,
                callback_port_id: entry.callback_port_id,
                port_initial_context: entry.port_initial_context,
                binary: entry.binary,
            })
            .await?;
        Ok(())
    }
}
