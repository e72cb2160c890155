//! Coordinator actor - sole owner of plugin lifecycle state.
//!
//! Every task that needs the operation table or the plugin store goes through
//! this actor's mailbox, so allocate-and-insert and lookup-and-remove happen
//! inside one message handler.

use std::time::Instant;

use async_trait::async_trait;
use ecm_messages::{EcuAck, EcuCommand, EcuId};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::framework::{Actor, ActorContext, ActorError, ActorHandle, ActorState};
use crate::coordinator::{Coordinator, CoordinatorError, Inbound, StagedInstall, StagedUninstall};
use crate::operations::CacheSnapshot;
use crate::state::PluginRecord;

// =============================================================================
// Messages
// =============================================================================

/// Messages handled by CoordinatorActor.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Dispatch an inbound message through the router.
    Dispatch(Inbound),

    /// Fetch the installed plugins of one ECU, in insertion order.
    ListInstalled {
        ecu_id: EcuId,
        reply_to: oneshot::Sender<Result<Vec<PluginRecord>, CoordinatorError>>,
    },

    /// Report in-flight operation counts.
    Snapshot {
        reply_to: oneshot::Sender<CacheSnapshot>,
    },

    /// Periodic tick from the supervisor; expires overdue operations.
    Tick { tick_id: u64 },
}

// =============================================================================
// Coordinator Actor
// =============================================================================

/// Actor hosting the [`Coordinator`].
pub struct CoordinatorActor {
    coordinator: Coordinator,
}

impl CoordinatorActor {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// Route one inbound message. Only a damaged store stops the actor.
    async fn dispatch(&mut self, inbound: Inbound) -> Result<(), ActorError> {
        let kind = inbound.kind();
        match self.coordinator.process(inbound).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(ActorError::Permanent(e.to_string())),
            Err(e @ CoordinatorError::Gateway(_)) => {
                warn!(kind, error = %e, "Command not delivered");
                Ok(())
            }
            Err(e) => {
                error!(kind, error = %e, "Failed to process message");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Actor for CoordinatorActor {
    type Message = CoordinatorMessage;

    fn name(&self) -> &str {
        "coordinator"
    }

    async fn handle(
        &mut self,
        msg: CoordinatorMessage,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        match msg {
            CoordinatorMessage::Dispatch(inbound) => {
                self.dispatch(inbound).await?;
            }

            CoordinatorMessage::ListInstalled { ecu_id, reply_to } => {
                let _ = reply_to.send(self.coordinator.installed(ecu_id));
            }

            CoordinatorMessage::Snapshot { reply_to } => {
                let _ = reply_to.send(self.coordinator.snapshot());
            }

            CoordinatorMessage::Tick { tick_id } => {
                let expired = self.coordinator.expire_stale(Instant::now());
                if !expired.is_empty() {
                    info!(tick_id, expired = expired.len(), "Expired overdue operations");
                }
                debug!(tick_id, "Coordinator tick");
            }
        }

        Ok(true)
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext) {
        let snapshot = self.coordinator.snapshot();
        if ctx.state == ActorState::Failed {
            error!(
                actor_id = %ctx.actor_id,
                pending_installs = snapshot.pending_installs,
                pending_uninstalls = snapshot.pending_uninstalls,
                "Coordinator failed; unacknowledged operations are lost"
            );
        } else if snapshot.pending_installs + snapshot.pending_uninstalls > 0 {
            warn!(
                actor_id = %ctx.actor_id,
                pending_installs = snapshot.pending_installs,
                pending_uninstalls = snapshot.pending_uninstalls,
                "Stopping with unacknowledged operations"
            );
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed front for the coordinator actor's mailbox.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: ActorHandle<CoordinatorMessage>,
}

impl CoordinatorHandle {
    pub fn new(inner: ActorHandle<CoordinatorMessage>) -> Self {
        Self { inner }
    }

    /// Queue an inbound message for dispatch.
    pub async fn dispatch(&self, inbound: Inbound) -> Result<(), ActorError> {
        self.inner.send(CoordinatorMessage::Dispatch(inbound)).await
    }

    /// Forward a command to its ECU unchanged.
    pub async fn command(&self, command: EcuCommand) -> Result<(), ActorError> {
        self.dispatch(Inbound::Command(command)).await
    }

    pub async fn stage_install(&self, staged: StagedInstall) -> Result<(), ActorError> {
        self.dispatch(Inbound::StageInstall(staged)).await
    }

    pub async fn stage_uninstall(&self, staged: StagedUninstall) -> Result<(), ActorError> {
        self.dispatch(Inbound::StageUninstall(staged)).await
    }

    /// Hand a message produced by an ECU to the router.
    pub async fn ack(&self, ack: EcuAck) -> Result<(), ActorError> {
        self.dispatch(Inbound::Ack(ack)).await
    }

    /// Installed plugins of an ECU, in insertion order.
    pub async fn list_installed(&self, ecu_id: EcuId) -> Result<Vec<PluginRecord>, ActorError> {
        self.inner
            .request(|reply_to| CoordinatorMessage::ListInstalled { ecu_id, reply_to })
            .await?
            .map_err(|e| ActorError::Transient(e.to_string()))
    }

    /// In-flight operation counts.
    ///
    /// Replies are ordered after every message queued before this call, so a
    /// snapshot also acts as a barrier.
    pub async fn snapshot(&self) -> Result<CacheSnapshot, ActorError> {
        self.inner
            .request(|reply_to| CoordinatorMessage::Snapshot { reply_to })
            .await
    }

    /// Best-effort tick; dropped when the mailbox is full.
    pub fn tick(&self, tick_id: u64) -> Result<(), ActorError> {
        self.inner.try_send(CoordinatorMessage::Tick { tick_id })
    }

    pub fn actor_id(&self) -> &str {
        self.inner.actor_id()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use ecm_messages::{LinkContextEntry, OperationId, PluginBinary, ServerPacket};

    use super::*;
    use crate::actors::framework::Supervisor;
    use crate::gateway::{MockEcuGateway, MockTelemetryChannel, MockTrustedChannel};
    use crate::state::PluginStore;

    fn record(dir: &std::path::Path, name: &str) -> PluginRecord {
        PluginRecord {
            app_id: 11,
            remote_ecu_id: 3,
            plugin_name: name.to_string(),
            executable_plugin_name: name.to_string(),
            callback_port_id: 1,
            sending_port_id: 2,
            port_initial_context: Default::default(),
            port_linking_context: vec![LinkContextEntry {
                from_port_id: 1,
                remote_ecu_id: 2,
                to_port_id: 4,
            }],
            location: dir.join(name),
        }
    }

    #[tokio::test]
    async fn test_actor_serves_install_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let ecus = Arc::new(MockEcuGateway::new());
        let trusted = Arc::new(MockTrustedChannel::new());
        let coordinator = Coordinator::new(
            "VIN9".to_string(),
            PluginStore::open_in_memory().unwrap(),
            ecus.clone(),
            trusted.clone(),
            Arc::new(MockTelemetryChannel::new()),
            Duration::from_secs(60),
        );

        let mut supervisor = Supervisor::default();
        let handle = CoordinatorHandle::new(supervisor.spawn(CoordinatorActor::new(coordinator), 16));

        handle
            .stage_install(StagedInstall {
                record: record(dir.path(), "nav.zip"),
                binary: PluginBinary::new(vec![1, 2, 3]),
            })
            .await
            .unwrap();
        assert_eq!(handle.snapshot().await.unwrap().pending_installs, 1);

        let plugin_id = match &ecus.sent().await[0] {
            EcuCommand::Install { plugin_id, .. } => *plugin_id,
            other => panic!("unexpected command: {other:?}"),
        };
        handle
            .ack(EcuAck::InstallAck {
                plugin_id,
                plugin_name: None,
            })
            .await
            .unwrap();

        let installed = handle.list_installed(3).await.unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].plugin_name, "nav.zip");
        assert_eq!(handle.snapshot().await.unwrap().pending_installs, 0);
        assert_eq!(
            trusted.sent().await,
            vec![ServerPacket::InstallAck {
                vin: "VIN9".to_string(),
                app_id: 11,
                plugin_name: "nav.suite".to_string(),
            }]
        );

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_actor() {
        let coordinator = Coordinator::new(
            "VIN9".to_string(),
            PluginStore::open_in_memory().unwrap(),
            Arc::new(MockEcuGateway::new()),
            Arc::new(MockTrustedChannel::new()),
            Arc::new(MockTelemetryChannel::new()),
            Duration::from_secs(60),
        );
        let mut supervisor = Supervisor::default();
        let handle = CoordinatorHandle::new(supervisor.spawn(CoordinatorActor::new(coordinator), 16));

        handle
            .ack(EcuAck::InstallAck {
                plugin_id: OperationId::new(42).unwrap(),
                plugin_name: None,
            })
            .await
            .unwrap();
        handle.tick(1).unwrap();

        assert!(handle.list_installed(2).await.unwrap().is_empty());
        assert_eq!(supervisor.running_count(), 1);

        supervisor.stop_all().await;
    }
}
