//! Integration tests for the plugin lifecycle through the coordinator actor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use ecm_agent::actors::{CoordinatorActor, CoordinatorHandle, Supervisor};
use ecm_agent::state::PluginStore;
use ecm_agent::unpack::{UnpackReport, Unpacker};
use ecm_agent::{Coordinator, MockEcuGateway, MockTelemetryChannel, MockTrustedChannel};
use ecm_messages::{
    EcuAck, EcuCommand, InstallEntry, LinkContextEntry, OperationId, PluginBinary, ServerPacket,
    UninstallEntry,
};

struct Harness {
    coordinator: CoordinatorHandle,
    unpacker: Unpacker,
    ecus: Arc<MockEcuGateway>,
    trusted: Arc<MockTrustedChannel>,
    supervisor: Supervisor,
    dir: tempfile::TempDir,
}

fn harness_with_store(dir: tempfile::TempDir, store: PluginStore) -> Harness {
    let ecus = Arc::new(MockEcuGateway::new());
    let trusted = Arc::new(MockTrustedChannel::new());
    let coordinator = Coordinator::new(
        "WVW123".to_string(),
        store,
        ecus.clone(),
        trusted.clone(),
        Arc::new(MockTelemetryChannel::new()),
        Duration::from_secs(120),
    );

    let mut supervisor = Supervisor::default();
    let handle = CoordinatorHandle::new(supervisor.spawn(CoordinatorActor::new(coordinator), 64));
    let unpacker = Unpacker::new(
        "WVW123".to_string(),
        dir.path().join("apps"),
        dir.path().join("restore"),
        handle.clone(),
        trusted.clone(),
    );

    Harness {
        coordinator: handle,
        unpacker,
        ecus,
        trusted,
        supervisor,
        dir,
    }
}

fn harness() -> Harness {
    harness_with_store(
        tempfile::tempdir().unwrap(),
        PluginStore::open_in_memory().unwrap(),
    )
}

fn install_entry(name: &str, app_id: i32, reference: i32) -> InstallEntry {
    InstallEntry {
        app_id,
        reference,
        sending_port_id: 10,
        callback_port_id: 11,
        plugin_name: name.to_string(),
        executable_plugin_name: format!("plugin://apps/{name}"),
        port_initial_context: [("speed".to_string(), 1)].into_iter().collect(),
        port_linking_context: Some(vec![LinkContextEntry {
            from_port_id: 1,
            remote_ecu_id: 3,
            to_port_id: 2,
        }]),
        binary: PluginBinary::new(format!("binary of {name}").into_bytes()),
    }
}

fn install_ids(commands: &[EcuCommand]) -> Vec<OperationId> {
    commands
        .iter()
        .filter_map(|command| match command {
            EcuCommand::Install { plugin_id, .. } => Some(*plugin_id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_concurrent_batches_get_distinct_ids() {
    let h = harness();

    let batch = |prefix: &str| ServerPacket::Install {
        entries: (0..20)
            .map(|i| install_entry(&format!("{prefix}{i}.zip"), i, 2))
            .collect(),
    };

    let first = tokio::spawn({
        let unpacker = h.unpacker.clone();
        let packet = batch("a");
        async move { unpacker.unpack(packet).await }
    });
    let second = tokio::spawn({
        let unpacker = h.unpacker.clone();
        let packet = batch("b");
        async move { unpacker.unpack(packet).await }
    });

    assert_eq!(first.await.unwrap().staged, 20);
    assert_eq!(second.await.unwrap().staged, 20);
    assert_eq!(h.coordinator.snapshot().await.unwrap().pending_installs, 40);

    let ids = install_ids(&h.ecus.sent().await);
    assert_eq!(ids.len(), 40);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 40);
}

#[tokio::test]
async fn test_install_then_uninstall_roundtrip() {
    let h = harness();

    let report = h
        .unpacker
        .unpack(ServerPacket::Install {
            entries: vec![install_entry("foo.zip", 7, 2)],
        })
        .await;
    assert_eq!(report, UnpackReport { staged: 1, abandoned: 0 });
    h.coordinator.snapshot().await.unwrap();

    let plugin_id = install_ids(&h.ecus.sent().await)[0];
    h.coordinator
        .ack(EcuAck::InstallAck {
            plugin_id,
            plugin_name: Some("foo.zip".to_string()),
        })
        .await
        .unwrap();

    let installed = h.coordinator.list_installed(2).await.unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].app_id, 7);
    let location = installed[0].location.clone();
    assert!(location.exists());

    h.unpacker
        .unpack(ServerPacket::Uninstall {
            entries: vec![UninstallEntry {
                plugin_name: "foo.zip".to_string(),
                callback_port_id: 11,
                reference: 2,
            }],
        })
        .await;
    assert_eq!(h.coordinator.snapshot().await.unwrap().pending_uninstalls, 1);

    let uninstall_id = h
        .ecus
        .sent()
        .await
        .into_iter()
        .find_map(|command| match command {
            EcuCommand::Uninstall { plugin_id, .. } => Some(plugin_id),
            _ => None,
        })
        .unwrap();
    h.coordinator
        .ack(EcuAck::UninstallAck {
            plugin_id: Some(uninstall_id),
            plugin_name: None,
        })
        .await
        .unwrap();

    let snapshot = h.coordinator.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_installs, 0);
    assert_eq!(snapshot.pending_uninstalls, 0);
    assert!(h.coordinator.list_installed(2).await.unwrap().is_empty());
    assert!(!location.exists());

    assert_eq!(
        h.trusted.sent().await,
        vec![
            ServerPacket::InstallLinuxAck {
                vin: "WVW123".to_string(),
                plugin_name: "foo.zip".to_string(),
            },
            ServerPacket::InstallAck {
                vin: "WVW123".to_string(),
                app_id: 7,
                plugin_name: "foo.suite".to_string(),
            },
            ServerPacket::UninstallAck {
                vin: "WVW123".to_string(),
                plugin_name: "foo.suite".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn test_uninstall_of_never_installed_plugin() {
    let h = harness();

    h.unpacker
        .unpack(ServerPacket::Uninstall {
            entries: vec![UninstallEntry {
                plugin_name: "never.zip".to_string(),
                callback_port_id: 1,
                reference: 3,
            }],
        })
        .await;

    assert_eq!(h.coordinator.snapshot().await.unwrap().pending_uninstalls, 0);
    assert!(h.ecus.sent().await.is_empty());
    assert!(h.trusted.sent().await.is_empty());
}

#[tokio::test]
async fn test_restore_ack_leaves_store_untouched() {
    let h = harness();

    h.unpacker
        .unpack(ServerPacket::Restore {
            entries: vec![install_entry("r.zip", 3, 3)],
        })
        .await;
    h.coordinator
        .ack(EcuAck::RestoreAck {
            plugin_name: "r.zip".to_string(),
        })
        .await
        .unwrap();

    assert!(h.coordinator.list_installed(3).await.unwrap().is_empty());
    assert!(h.dir.path().join("restore/r.zip").exists());
    assert_eq!(
        h.trusted.sent().await,
        vec![ServerPacket::RestoreAck {
            vin: "WVW123".to_string(),
            plugin_name: "r.zip".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_installed_records_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("plugins.db");

    let mut h = harness_with_store(dir, PluginStore::open(&db_path).unwrap());
    h.unpacker
        .unpack(ServerPacket::Install {
            entries: vec![install_entry("keep.zip", 4, 2)],
        })
        .await;
    h.coordinator.snapshot().await.unwrap();
    let plugin_id = install_ids(&h.ecus.sent().await)[0];
    h.coordinator
        .ack(EcuAck::InstallAck {
            plugin_id,
            plugin_name: None,
        })
        .await
        .unwrap();
    h.coordinator.snapshot().await.unwrap();
    h.supervisor.stop_all().await;

    let reopened = PluginStore::open(&db_path).unwrap();
    let records = reopened.list(2).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].plugin_name, "keep.zip");
    assert_eq!(records[0].port_initial_context.get("speed"), Some(&1));
    assert_eq!(reopened.app_id("keep.zip").unwrap(), Some(4));
}
