//! Plugin lifecycle coordinator.
//!
//! The coordinator is the single dispatch point between the three message
//! vocabularies. It owns the in-flight operation table and the durable plugin
//! store, and is driven by exactly one task (`CoordinatorActor`), so every
//! read-modify-write on that state is serialized.
//!
//! ## Dispatch
//!
//! ```text
//! Command(install|uninstall|restore|load|power) -> ECU gateway, verbatim
//! StageInstall      -> allocate id, park record, forward Install
//! StageUninstall    -> check store, allocate id, park name, forward Uninstall
//! Ack(install_ack)  -> commit record, look up app id, InstallAck upstream (.zip -> .suite)
//! Ack(uninstall_ack)-> delete file + record, UninstallAck upstream (.zip -> .suite)
//! Ack(restore_ack)  -> RestoreAck upstream, name unchanged
//! Ack(publish)      -> IoT publish
//! Ack(load_ack)     -> log
//! Ack(plugin_message) -> log
//! ```
//!
//! Every failure is returned as a [`CoordinatorError`]; the actor logs it and
//! keeps serving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ecm_messages::{
    to_server_name, EcuAck, EcuCommand, EcuId, IotPacket, OperationId, PluginBinary, PortId,
    ServerPacket,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::files::PluginFiles;
use crate::gateway::{EcuGateway, TelemetryChannel, TrustedChannel};
use crate::operations::{CacheSnapshot, ExpiredOperation, OperationError, OperationTable};
use crate::state::{PluginRecord, PluginStore, StoreError};

/// Errors surfaced by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// An acknowledgment referenced an identifier with no in-flight operation.
    #[error("no in-flight operation with id {0}")]
    UnknownOperation(OperationId),

    /// The plugin is not in the durable store.
    #[error("plugin {0:?} is not installed")]
    PluginNotFound(String),

    /// An uninstall acknowledgment carried neither a known id nor a name.
    #[error("uninstall acknowledgment does not identify a plugin")]
    UnresolvedUninstall,

    /// Every operation identifier is held by an unacknowledged operation.
    #[error("no operation identifier available")]
    CapacityExhausted,

    #[error("plugin store error: {0}")]
    Store(#[from] StoreError),

    /// A command could not be delivered to its ECU.
    #[error("ECU gateway error: {0}")]
    Gateway(#[source] anyhow::Error),

    /// A packet could not be sent to the trusted server or IoT endpoint.
    #[error("upstream channel error: {0}")]
    Upstream(#[source] anyhow::Error),
}

impl CoordinatorError {
    /// Whether the plugin store itself is damaged, so no later message can
    /// be served correctly.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Store(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

impl From<OperationError> for CoordinatorError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::CapacityExhausted => Self::CapacityExhausted,
            OperationError::Unknown(id) => Self::UnknownOperation(id),
        }
    }
}

/// An install entry unpacked from the trusted server, binary already on disk.
#[derive(Debug, Clone)]
pub struct StagedInstall {
    pub record: PluginRecord,
    pub binary: PluginBinary,
}

/// An uninstall entry unpacked from the trusted server.
#[derive(Debug, Clone)]
pub struct StagedUninstall {
    pub plugin_name: String,
    pub callback_port_id: PortId,
    pub reference: EcuId,
}

/// Inputs the coordinator dispatches on.
#[derive(Debug)]
pub enum Inbound {
    /// Forward a command to its ECU unchanged.
    Command(EcuCommand),
    /// Start tracking an install and forward it.
    StageInstall(StagedInstall),
    /// Start tracking an uninstall and forward it.
    StageUninstall(StagedUninstall),
    /// Message produced by an ECU.
    Ack(EcuAck),
}

impl Inbound {
    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(command) => command.kind(),
            Self::StageInstall(_) => "stage_install",
            Self::StageUninstall(_) => "stage_uninstall",
            Self::Ack(ack) => ack.kind(),
        }
    }
}

/// Downstream channels. Kept apart from the store so that awaiting a send
/// only borrows `Sync` state.
struct Links {
    ecus: Arc<dyn EcuGateway>,
    trusted: Arc<dyn TrustedChannel>,
    telemetry: Arc<dyn TelemetryChannel>,
}

impl Links {
    async fn forward(&self, command: EcuCommand) -> Result<(), CoordinatorError> {
        debug!(
            kind = command.kind(),
            reference = command.reference(),
            "Forwarding command to ECU"
        );
        self.ecus
            .send(command)
            .await
            .map_err(CoordinatorError::Gateway)
    }

    async fn upstream(&self, packet: ServerPacket) -> Result<(), CoordinatorError> {
        self.trusted
            .send(packet)
            .await
            .map_err(CoordinatorError::Upstream)
    }

    async fn publish(&self, packet: IotPacket) -> Result<(), CoordinatorError> {
        self.telemetry
            .publish(packet)
            .await
            .map_err(CoordinatorError::Upstream)
    }
}

/// Plugin lifecycle coordinator.
pub struct Coordinator {
    /// Vehicle identifier stamped on upstream packets.
    vin: String,

    /// Durable plugin records.
    store: PluginStore,

    /// In-flight installs and uninstalls.
    operations: OperationTable,

    files: PluginFiles,

    links: Links,

    /// Age after which an unacknowledged operation is expired.
    ack_timeout: Duration,
}

impl Coordinator {
    /// Create a coordinator with empty in-flight state.
    pub fn new(
        vin: String,
        store: PluginStore,
        ecus: Arc<dyn EcuGateway>,
        trusted: Arc<dyn TrustedChannel>,
        telemetry: Arc<dyn TelemetryChannel>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            vin,
            store,
            operations: OperationTable::new(),
            files: PluginFiles::new(),
            links: Links {
                ecus,
                trusted,
                telemetry,
            },
            ack_timeout,
        }
    }

    /// Dispatch one inbound message.
    pub async fn process(&mut self, inbound: Inbound) -> Result<(), CoordinatorError> {
        match inbound {
            Inbound::Command(command) => self.links.forward(command).await,
            Inbound::StageInstall(staged) => self.stage_install(staged).await.map(|_| ()),
            Inbound::StageUninstall(staged) => self.stage_uninstall(staged).await.map(|_| ()),
            Inbound::Ack(ack) => self.handle_ack(ack).await,
        }
    }

    /// Park an install under a fresh identifier and forward it.
    pub async fn stage_install(
        &mut self,
        staged: StagedInstall,
    ) -> Result<OperationId, CoordinatorError> {
        let StagedInstall { record, binary } = staged;

        let plugin_id = match self.operations.stage_install(record.clone(), Instant::now()) {
            Ok(id) => id,
            Err(e) => {
                self.discard_staged_binary(&record);
                return Err(e.into());
            }
        };

        info!(
            plugin_name = %record.plugin_name,
            plugin_id = %plugin_id,
            reference = record.remote_ecu_id,
            "Install staged"
        );

        let command = EcuCommand::Install {
            reference: record.remote_ecu_id,
            plugin_id,
            executable_plugin_name: record.executable_plugin_name,
            callback_port_id: record.callback_port_id,
            port_initial_context: record.port_initial_context,
            port_linking_context: record.port_linking_context,
            binary,
        };

        if let Err(e) = self.links.forward(command).await {
            // Nothing will acknowledge an undelivered command.
            if let Ok(pending) = self.operations.take_install(plugin_id) {
                self.discard_staged_binary(&pending.record);
            }
            return Err(e);
        }

        Ok(plugin_id)
    }

    /// Park an uninstall under a fresh identifier and forward it.
    ///
    /// Fails with `PluginNotFound` when the plugin is not installed; nothing
    /// is forwarded in that case.
    pub async fn stage_uninstall(
        &mut self,
        staged: StagedUninstall,
    ) -> Result<OperationId, CoordinatorError> {
        let StagedUninstall {
            plugin_name,
            callback_port_id,
            reference,
        } = staged;

        if self.store.get(&plugin_name)?.is_none() {
            return Err(CoordinatorError::PluginNotFound(plugin_name));
        }

        let plugin_id = self
            .operations
            .stage_uninstall(plugin_name.clone(), Instant::now())?;

        info!(
            plugin_name = %plugin_name,
            plugin_id = %plugin_id,
            reference,
            "Uninstall staged"
        );

        let command = EcuCommand::Uninstall {
            reference,
            plugin_id,
            plugin_name,
            callback_port_id,
        };

        if let Err(e) = self.links.forward(command).await {
            self.operations.take_uninstall(plugin_id).ok();
            return Err(e);
        }

        Ok(plugin_id)
    }

    /// Handle a message produced by an ECU.
    pub async fn handle_ack(&mut self, ack: EcuAck) -> Result<(), CoordinatorError> {
        match ack {
            EcuAck::InstallAck {
                plugin_id,
                plugin_name,
            } => self.on_install_ack(plugin_id, plugin_name).await,

            EcuAck::UninstallAck {
                plugin_id,
                plugin_name,
            } => self.on_uninstall_ack(plugin_id, plugin_name).await,

            EcuAck::RestoreAck { plugin_name } => {
                info!(plugin_name = %plugin_name, "Plugin restored");
                self.links
                    .upstream(ServerPacket::RestoreAck {
                        vin: self.vin.clone(),
                        plugin_name,
                    })
                    .await
            }

            EcuAck::Publish { key, value } => {
                info!(key = %key, value = %value, "Relaying publish to IoT server");
                self.links.publish(IotPacket::Publish { key, value }).await
            }

            EcuAck::LoadAck { plugin_name } => {
                info!(plugin_name = %plugin_name, "Plugin loaded");
                Ok(())
            }

            EcuAck::PluginMessage { payload } => {
                info!(payload_len = payload.len(), "Plugin message received");
                Ok(())
            }
        }
    }

    async fn on_install_ack(
        &mut self,
        plugin_id: OperationId,
        plugin_name: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let pending = self.operations.take_install(plugin_id)?;

        if let Err(e) = self.store.put(&pending.record) {
            // Keep the operation resolvable by a retried acknowledgment.
            self.operations.reinstate_install(plugin_id, pending);
            return Err(e.into());
        }

        let plugin_name = plugin_name.unwrap_or_else(|| pending.record.plugin_name.clone());
        let app_id = self
            .store
            .app_id(&plugin_name)?
            .ok_or_else(|| CoordinatorError::PluginNotFound(plugin_name.clone()))?;

        info!(
            plugin_name = %plugin_name,
            plugin_id = %plugin_id,
            app_id,
            "Plugin installed"
        );

        self.links
            .upstream(ServerPacket::InstallAck {
                vin: self.vin.clone(),
                app_id,
                plugin_name: to_server_name(&plugin_name),
            })
            .await
    }

    async fn on_uninstall_ack(
        &mut self,
        plugin_id: Option<OperationId>,
        plugin_name: Option<String>,
    ) -> Result<(), CoordinatorError> {
        let cached_name = match (plugin_id, plugin_name.as_deref()) {
            (Some(id), _) => match self.operations.take_uninstall(id) {
                Ok(pending) => Some(pending.plugin_name),
                Err(_) if plugin_name.is_none() => {
                    return Err(CoordinatorError::UnknownOperation(id));
                }
                Err(_) => {
                    warn!(plugin_id = %id, "Uninstall acknowledgment id is not in flight");
                    None
                }
            },
            (None, Some(name)) => self
                .operations
                .take_uninstall_by_name(name)
                .map(|(_, pending)| pending.plugin_name),
            (None, None) => None,
        };

        let plugin_name = match (plugin_name, cached_name) {
            (Some(acked), Some(cached)) if acked != cached => {
                warn!(
                    acked = %acked,
                    cached = %cached,
                    "Uninstall acknowledgment names a different plugin than requested"
                );
                acked
            }
            (Some(name), _) | (None, Some(name)) => name,
            (None, None) => return Err(CoordinatorError::UnresolvedUninstall),
        };

        let record = self
            .store
            .get(&plugin_name)?
            .ok_or_else(|| CoordinatorError::PluginNotFound(plugin_name.clone()))?;

        if !self.files.delete(&record.location) {
            warn!(
                plugin_name = %plugin_name,
                location = %record.location.display(),
                "Plugin file was already absent"
            );
        }
        self.store.delete(&plugin_name)?;

        info!(plugin_name = %plugin_name, "Plugin uninstalled");

        self.links
            .upstream(ServerPacket::UninstallAck {
                vin: self.vin.clone(),
                plugin_name: to_server_name(&plugin_name),
            })
            .await
    }

    /// Remove the binary of an install that will never commit.
    ///
    /// The file stays when an installed plugin or another pending install
    /// points at the same location.
    fn discard_staged_binary(&self, record: &PluginRecord) {
        let location = record.location.as_path();
        if self.operations.install_pending_at(location) {
            debug!(
                plugin_name = %record.plugin_name,
                "Keeping binary still staged by another install"
            );
            return;
        }

        match self.store.get(&record.plugin_name) {
            Ok(Some(installed)) if installed.location == record.location => {
                debug!(
                    plugin_name = %record.plugin_name,
                    "Keeping binary of installed plugin"
                );
            }
            Ok(_) => {
                self.files.delete(location);
            }
            Err(e) => {
                warn!(
                    plugin_name = %record.plugin_name,
                    error = %e,
                    "Cannot check plugin store; keeping staged binary"
                );
            }
        }
    }

    /// Expire operations whose acknowledgment is overdue.
    ///
    /// An expired install loses its staged binary unless an installed plugin
    /// still uses that file.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<ExpiredOperation> {
        let expired = self.operations.expire(now, self.ack_timeout);

        for operation in &expired {
            match operation {
                ExpiredOperation::Install(id, pending) => {
                    warn!(
                        plugin_id = %id,
                        plugin_name = %pending.record.plugin_name,
                        timeout_secs = self.ack_timeout.as_secs(),
                        "Install acknowledgment timed out"
                    );
                    self.discard_staged_binary(&pending.record);
                }
                ExpiredOperation::Uninstall(id, pending) => {
                    warn!(
                        plugin_id = %id,
                        plugin_name = %pending.plugin_name,
                        timeout_secs = self.ack_timeout.as_secs(),
                        "Uninstall acknowledgment timed out"
                    );
                }
            }
        }

        expired
    }

    /// Installed plugins of an ECU, in insertion order.
    pub fn installed(&self, ecu_id: EcuId) -> Result<Vec<PluginRecord>, CoordinatorError> {
        Ok(self.store.list(ecu_id)?)
    }

    /// In-flight operation counts.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.operations.snapshot()
    }

    /// Durable plugin store.
    pub fn store(&self) -> &PluginStore {
        &self.store
    }

    /// In-flight operation table.
    pub fn operations(&self) -> &OperationTable {
        &self.operations
    }
}

#[cfg(test)]
mod tests {
    use ecm_messages::LinkContextEntry;

    use super::*;
    use crate::gateway::{MockEcuGateway, MockTelemetryChannel, MockTrustedChannel};

    struct Fixture {
        coordinator: Coordinator,
        ecus: Arc<MockEcuGateway>,
        trusted: Arc<MockTrustedChannel>,
        telemetry: Arc<MockTelemetryChannel>,
        dir: tempfile::TempDir,
    }

    fn fixture_with(ecus: MockEcuGateway) -> Fixture {
        let ecus = Arc::new(ecus);
        let trusted = Arc::new(MockTrustedChannel::new());
        let telemetry = Arc::new(MockTelemetryChannel::new());
        let coordinator = Coordinator::new(
            "VIN1".to_string(),
            PluginStore::open_in_memory().unwrap(),
            ecus.clone(),
            trusted.clone(),
            telemetry.clone(),
            Duration::from_secs(60),
        );
        Fixture {
            coordinator,
            ecus,
            trusted,
            telemetry,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockEcuGateway::new())
    }

    fn staged(dir: &std::path::Path, name: &str, app_id: i32) -> StagedInstall {
        let location = dir.join(name);
        std::fs::write(&location, b"bin").unwrap();
        StagedInstall {
            record: PluginRecord {
                app_id,
                remote_ecu_id: 2,
                plugin_name: name.to_string(),
                executable_plugin_name: format!("plugin://{name}"),
                callback_port_id: 5,
                sending_port_id: 6,
                port_initial_context: Default::default(),
                port_linking_context: vec![LinkContextEntry {
                    from_port_id: 1,
                    remote_ecu_id: 3,
                    to_port_id: 2,
                }],
                location,
            },
            binary: PluginBinary::new(b"bin".to_vec()),
        }
    }

    async fn install(f: &mut Fixture, name: &str, app_id: i32) -> OperationId {
        let staged = staged(f.dir.path(), name, app_id);
        let id = f.coordinator.stage_install(staged).await.unwrap();
        f.coordinator
            .handle_ack(EcuAck::InstallAck {
                plugin_id: id,
                plugin_name: None,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_stage_install_forwards_command() {
        let mut f = fixture();
        let staged = staged(f.dir.path(), "foo.zip", 7);

        let id = f.coordinator.stage_install(staged).await.unwrap();
        assert!(f.coordinator.operations().has_install(id));

        let sent = f.ecus.sent().await;
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            EcuCommand::Install {
                reference,
                plugin_id,
                executable_plugin_name,
                port_linking_context,
                ..
            } => {
                assert_eq!(*reference, 2);
                assert_eq!(*plugin_id, id);
                assert_eq!(executable_plugin_name, "plugin://foo.zip");
                assert_eq!(port_linking_context.len(), 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_install_ack_commits_and_rewrites_name() {
        let mut f = fixture();
        let id = install(&mut f, "foo.zip", 7).await;

        assert!(!f.coordinator.operations().has_install(id));
        assert!(f.coordinator.store().get("foo.zip").unwrap().is_some());

        let sent = f.trusted.sent().await;
        assert_eq!(
            sent,
            vec![ServerPacket::InstallAck {
                vin: "VIN1".to_string(),
                app_id: 7,
                plugin_name: "foo.suite".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_install_ack_for_unknown_id() {
        let mut f = fixture();
        let id = OperationId::new(9).unwrap();

        let result = f
            .coordinator
            .handle_ack(EcuAck::InstallAck {
                plugin_id: id,
                plugin_name: Some("foo.zip".to_string()),
            })
            .await;

        assert!(matches!(result, Err(CoordinatorError::UnknownOperation(got)) if got == id));
        assert!(f.trusted.sent().await.is_empty());
        assert_eq!(f.coordinator.store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_install_ack_with_unknown_name_is_surfaced() {
        let mut f = fixture();
        let staged = staged(f.dir.path(), "foo.zip", 7);
        let id = f.coordinator.stage_install(staged).await.unwrap();

        let result = f
            .coordinator
            .handle_ack(EcuAck::InstallAck {
                plugin_id: id,
                plugin_name: Some("other.zip".to_string()),
            })
            .await;

        assert!(matches!(result, Err(CoordinatorError::PluginNotFound(name)) if name == "other.zip"));
        assert!(f.trusted.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_roundtrip_removes_record_and_file() {
        let mut f = fixture();
        install(&mut f, "foo.zip", 7).await;
        let location = f.dir.path().join("foo.zip");
        assert!(location.exists());

        let id = f
            .coordinator
            .stage_uninstall(StagedUninstall {
                plugin_name: "foo.zip".to_string(),
                callback_port_id: 5,
                reference: 2,
            })
            .await
            .unwrap();
        assert!(f.coordinator.operations().has_uninstall(id));

        f.coordinator
            .handle_ack(EcuAck::UninstallAck {
                plugin_id: Some(id),
                plugin_name: None,
            })
            .await
            .unwrap();

        assert!(f.coordinator.store().get("foo.zip").unwrap().is_none());
        assert!(!location.exists());
        assert!(!f.coordinator.operations().has_uninstall(id));
        assert_eq!(
            f.trusted.sent().await.last(),
            Some(&ServerPacket::UninstallAck {
                vin: "VIN1".to_string(),
                plugin_name: "foo.suite".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_uninstall_ack_by_name_clears_cache() {
        let mut f = fixture();
        install(&mut f, "foo.zip", 7).await;
        let id = f
            .coordinator
            .stage_uninstall(StagedUninstall {
                plugin_name: "foo.zip".to_string(),
                callback_port_id: 5,
                reference: 2,
            })
            .await
            .unwrap();

        f.coordinator
            .handle_ack(EcuAck::UninstallAck {
                plugin_id: None,
                plugin_name: Some("foo.zip".to_string()),
            })
            .await
            .unwrap();

        assert!(!f.coordinator.operations().has_uninstall(id));
        assert_eq!(f.coordinator.snapshot().pending_uninstalls, 0);
    }

    #[tokio::test]
    async fn test_uninstall_of_unknown_plugin_is_not_found() {
        let mut f = fixture();

        let result = f
            .coordinator
            .stage_uninstall(StagedUninstall {
                plugin_name: "ghost.zip".to_string(),
                callback_port_id: 5,
                reference: 2,
            })
            .await;

        assert!(matches!(result, Err(CoordinatorError::PluginNotFound(name)) if name == "ghost.zip"));
        assert!(f.ecus.sent().await.is_empty());
        assert!(f.trusted.sent().await.is_empty());
        assert_eq!(f.coordinator.snapshot().pending_uninstalls, 0);
    }

    #[tokio::test]
    async fn test_uninstall_ack_for_unknown_plugin_is_not_found() {
        let mut f = fixture();

        let result = f
            .coordinator
            .handle_ack(EcuAck::UninstallAck {
                plugin_id: None,
                plugin_name: Some("ghost.zip".to_string()),
            })
            .await;
        assert!(matches!(result, Err(CoordinatorError::PluginNotFound(_))));

        let result = f
            .coordinator
            .handle_ack(EcuAck::UninstallAck {
                plugin_id: OperationId::new(3),
                plugin_name: None,
            })
            .await;
        assert!(matches!(result, Err(CoordinatorError::UnknownOperation(_))));

        let result = f
            .coordinator
            .handle_ack(EcuAck::UninstallAck {
                plugin_id: None,
                plugin_name: None,
            })
            .await;
        assert!(matches!(result, Err(CoordinatorError::UnresolvedUninstall)));

        assert!(f.trusted.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_ack_keeps_name_and_store() {
        let mut f = fixture();
        install(&mut f, "foo.zip", 7).await;
        let before = f.coordinator.store().count().unwrap();

        f.coordinator
            .handle_ack(EcuAck::RestoreAck {
                plugin_name: "bar.zip".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(f.coordinator.store().count().unwrap(), before);
        assert_eq!(
            f.trusted.sent().await.last(),
            Some(&ServerPacket::RestoreAck {
                vin: "VIN1".to_string(),
                plugin_name: "bar.zip".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_publish_goes_to_telemetry() {
        let mut f = fixture();

        f.coordinator
            .handle_ack(EcuAck::Publish {
                key: "speed".to_string(),
                value: "42".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            f.telemetry.published().await,
            vec![IotPacket::Publish {
                key: "speed".to_string(),
                value: "42".to_string(),
            }]
        );
        assert!(f.trusted.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_ack_and_plugin_message_have_no_side_effects() {
        let mut f = fixture();

        f.coordinator
            .handle_ack(EcuAck::LoadAck {
                plugin_name: "foo.zip".to_string(),
            })
            .await
            .unwrap();
        f.coordinator
            .handle_ack(EcuAck::PluginMessage {
                payload: "hello".to_string(),
            })
            .await
            .unwrap();

        assert!(f.trusted.sent().await.is_empty());
        assert!(f.telemetry.published().await.is_empty());
        assert!(f.ecus.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_commands_forward_verbatim() {
        let mut f = fixture();
        let command = EcuCommand::Power {
            reference: 3,
            value: 40,
        };

        f.coordinator
            .process(Inbound::Command(command.clone()))
            .await
            .unwrap();

        assert_eq!(f.ecus.sent().await, vec![command]);
    }

    #[tokio::test]
    async fn test_undelivered_install_is_not_left_in_flight() {
        let mut f = fixture_with(MockEcuGateway::failing());
        let staged = staged(f.dir.path(), "foo.zip", 7);

        let result = f.coordinator.stage_install(staged).await;

        assert!(matches!(result, Err(CoordinatorError::Gateway(_))));
        assert_eq!(f.coordinator.snapshot().pending_installs, 0);
        assert!(!f.dir.path().join("foo.zip").exists());
    }

    #[tokio::test]
    async fn test_expired_reinstall_keeps_installed_binary() {
        let mut f = fixture();
        install(&mut f, "foo.zip", 7).await;
        let staged = staged(f.dir.path(), "foo.zip", 7);
        let location = staged.record.location.clone();
        f.coordinator.stage_install(staged).await.unwrap();

        let expired = f
            .coordinator
            .expire_stale(Instant::now() + Duration::from_secs(61));

        assert_eq!(expired.len(), 1);
        assert!(f.coordinator.store().get("foo.zip").unwrap().is_some());
        assert!(location.exists());
    }

    #[tokio::test]
    async fn test_expired_install_keeps_binary_staged_again() {
        let mut f = fixture();
        let first = staged(f.dir.path(), "foo.zip", 7);
        let location = first.record.location.clone();
        let start = Instant::now();
        f.coordinator.stage_install(first).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = staged(f.dir.path(), "foo.zip", 7);
        let second_id = f.coordinator.stage_install(second).await.unwrap();

        // Only the first install is past the timeout here.
        let expired = f
            .coordinator
            .expire_stale(start + Duration::from_millis(60_010));

        assert_eq!(expired.len(), 1);
        assert!(f.coordinator.operations().has_install(second_id));
        assert!(location.exists());
    }

    #[tokio::test]
    async fn test_expired_install_rejects_late_ack() {
        let mut f = fixture();
        let staged = staged(f.dir.path(), "foo.zip", 7);
        let location = staged.record.location.clone();
        let id = f.coordinator.stage_install(staged).await.unwrap();

        let expired = f
            .coordinator
            .expire_stale(Instant::now() + Duration::from_secs(61));
        assert_eq!(expired.len(), 1);
        assert!(!location.exists());
        assert_eq!(f.coordinator.snapshot().expired_total, 1);

        let result = f
            .coordinator
            .handle_ack(EcuAck::InstallAck {
                plugin_id: id,
                plugin_name: None,
            })
            .await;
        assert!(matches!(result, Err(CoordinatorError::UnknownOperation(_))));
        assert!(f.coordinator.store().get("foo.zip").unwrap().is_none());
    }

    #[test]
    fn test_only_store_corruption_is_fatal() {
        let corrupt = CoordinatorError::Store(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            None,
        )));
        let busy = CoordinatorError::Store(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )));

        assert!(corrupt.is_fatal());
        assert!(!busy.is_fatal());
        assert!(!CoordinatorError::CapacityExhausted.is_fatal());
        assert!(!CoordinatorError::PluginNotFound("foo.zip".to_string()).is_fatal());
    }

    #[tokio::test]
    async fn test_installed_lists_in_insertion_order() {
        let mut f = fixture();
        install(&mut f, "b.zip", 1).await;
        install(&mut f, "a.zip", 2).await;

        let names: Vec<_> = f
            .coordinator
            .installed(2)
            .unwrap()
            .into_iter()
            .map(|r| r.plugin_name)
            .collect();
        assert_eq!(names, vec!["b.zip", "a.zip"]);
        assert_eq!(
            f.coordinator.installed(2).unwrap()[0].location,
            f.dir.path().join("b.zip")
        );
    }
}
