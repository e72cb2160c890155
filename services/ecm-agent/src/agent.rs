//! Wires the agent together and runs it until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ecm_messages::{IotPacket, ServerPacket};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::actors::{BackoffPolicy, EcmSupervisor};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::ecu::{run_ecu_listener, EcuRegistry};
use crate::gateway::QueuedChannel;
use crate::startup::StartupSequencer;
use crate::state::PluginStore;
use crate::telemetry::TelemetrySession;
use crate::unpack::Unpacker;
use crate::uplink::{run_unpack_worker, UplinkSession};

/// Interval between coordinator ticks.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Outbound packets buffered per upstream link while it reconnects.
const OUTBOUND_QUEUE: usize = 1024;

/// Inbound batches buffered ahead of the unpack worker.
const INBOUND_QUEUE: usize = 16;

/// How long the startup sequencer waits for each ECU to connect.
const ECU_CONNECT_WAIT: Duration = Duration::from_secs(30);

/// How long workers get to finish after shutdown.
const WORKER_GRACE: Duration = Duration::from_secs(5);

/// Run the agent until `shutdown` flips to `true`.
///
/// Returns an error if startup fails or the coordinator actor dies.
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    for dir in [&config.app_dir, &config.restore_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let store = PluginStore::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    info!(
        db_path = %config.db_path.display(),
        plugins = store.count().unwrap_or_default(),
        "Plugin store opened"
    );

    let listener = TcpListener::bind(config.ecu_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.ecu_listen_addr))?;

    let registry = Arc::new(EcuRegistry::new());
    let (trusted, trusted_rx) = QueuedChannel::<ServerPacket>::new(OUTBOUND_QUEUE);
    let (telemetry, telemetry_rx) = QueuedChannel::<IotPacket>::new(OUTBOUND_QUEUE);
    let trusted = Arc::new(trusted);

    let coordinator = Coordinator::new(
        config.vin.clone(),
        store,
        registry.clone(),
        trusted.clone(),
        Arc::new(telemetry),
        config.ack_timeout,
    );

    let mut supervisor = EcmSupervisor::new(TICK_INTERVAL, shutdown);
    let handle = supervisor.start(coordinator);

    // Workers stop when the supervisor loop ends, whatever the reason.
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    workers.push((
        "ecu_listener",
        tokio::spawn(run_ecu_listener(
            listener,
            registry.clone(),
            handle.clone(),
            stop_rx.clone(),
        )),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    workers.push((
        "uplink",
        tokio::spawn(
            UplinkSession::new(
                config.trusted_server_addr.clone(),
                config.vin.clone(),
                BackoffPolicy::default(),
                trusted_rx,
                inbound_tx,
            )
            .run(stop_rx.clone()),
        ),
    ));

    let unpacker = Unpacker::new(
        config.vin.clone(),
        config.app_dir.clone(),
        config.restore_dir.clone(),
        handle.clone(),
        trusted,
    );
    let unpack_stop = stop_rx.clone();
    workers.push((
        "unpack_worker",
        tokio::spawn(async move {
            run_unpack_worker(unpacker, inbound_rx, unpack_stop).await;
            Ok(())
        }),
    ));

    workers.push((
        "telemetry",
        tokio::spawn(
            TelemetrySession::new(
                config.iot_server_addr.clone(),
                BackoffPolicy::default(),
                telemetry_rx,
            )
            .run(stop_rx.clone()),
        ),
    ));

    let sequencer =
        StartupSequencer::new(config.startup_ecus.clone(), config.load_pacing, handle)
            .wait_for_ecus(registry.clone(), ECU_CONNECT_WAIT);
    let startup_stop = stop_rx;
    workers.push((
        "startup",
        tokio::spawn(async move {
            sequencer.run(startup_stop).await?;
            Ok(())
        }),
    ));

    info!(
        vin = %config.vin,
        ecu_listen_addr = %config.ecu_listen_addr,
        "ECM agent running"
    );

    let result = supervisor.run().await;
    let _ = stop_tx.send(true);

    for (name, mut worker) in workers {
        match tokio::time::timeout(WORKER_GRACE, &mut worker).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(worker = name, error = %e, "Worker exited with error"),
            Ok(Err(e)) => error!(worker = name, error = %e, "Worker panicked"),
            Err(_) => {
                warn!(worker = name, "Worker did not stop in time; aborting");
                worker.abort();
            }
        }
    }

    supervisor.shutdown().await;
    result
}
