//! Replays installed plugins to their ECUs when the agent starts.

use std::sync::Arc;
use std::time::Duration;

use ecm_messages::{EcuCommand, EcuId, PluginBinary};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::actors::{ActorError, CoordinatorHandle};
use crate::ecu::EcuRegistry;
use crate::files::PluginFiles;

/// Outcome of a startup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Load commands issued.
    pub loaded: usize,
    /// Records skipped because their binary could not be read.
    pub skipped: usize,
    /// Whether shutdown cut the run short.
    pub interrupted: bool,
}

/// Issues one `Load` per installed plugin, ECU by ECU, in insertion order.
pub struct StartupSequencer {
    ecus: Vec<EcuId>,

    /// Delay after each issued load.
    pacing: Duration,

    files: PluginFiles,
    coordinator: CoordinatorHandle,

    /// When set, wait up to the timeout for each ECU's session before
    /// replaying its plugins.
    readiness: Option<(Arc<EcuRegistry>, Duration)>,
}

impl StartupSequencer {
    pub fn new(ecus: Vec<EcuId>, pacing: Duration, coordinator: CoordinatorHandle) -> Self {
        Self {
            ecus,
            pacing,
            files: PluginFiles::new(),
            coordinator,
            readiness: None,
        }
    }

    /// Wait for each ECU to connect before loading its plugins.
    pub fn wait_for_ecus(mut self, registry: Arc<EcuRegistry>, timeout: Duration) -> Self {
        self.readiness = Some((registry, timeout));
        self
    }

    /// Run the sequence once.
    ///
    /// Fails only if the coordinator actor is gone.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<StartupReport, ActorError> {
        let mut report = StartupReport::default();

        for &ecu_id in &self.ecus {
            if let Some((registry, timeout)) = &self.readiness {
                tokio::select! {
                    waited = tokio::time::timeout(*timeout, registry.wait_connected(ecu_id)) => {
                        if waited.is_err() {
                            warn!(
                                ecu_id,
                                timeout_secs = timeout.as_secs(),
                                "ECU not connected; loading anyway"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            report.interrupted = true;
                            return Ok(report);
                        }
                    }
                }
            }

            let records = self.coordinator.list_installed(ecu_id).await?;
            info!(ecu_id, plugins = records.len(), "Loading installed plugins");

            for record in records {
                let binary = match self.files.read(&record.location) {
                    Ok(bytes) => PluginBinary::new(bytes),
                    Err(e) => {
                        warn!(
                            ecu_id,
                            plugin_name = %record.plugin_name,
                            error = %e,
                            "Skipping plugin with unreadable binary"
                        );
                        report.skipped += 1;
                        continue;
                    }
                };

                self.coordinator
                    .command(EcuCommand::Load {
                        reference: ecu_id,
                        executable_plugin_name: record.executable_plugin_name,
                        callback_port_id: record.callback_port_id,
                        port_initial_context: record.port_initial_context,
                        port_linking_context: record.port_linking_context,
                        binary,
                    })
                    .await?;
                report.loaded += 1;

                tokio::select! {
                    _ = tokio::time::sleep(self.pacing) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            report.interrupted = true;
                            info!(loaded = report.loaded, "Startup sequence interrupted");
                            return Ok(report);
                        }
                    }
                }
            }
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            "Startup sequence complete"
        );
        Ok(report)
    }
}
