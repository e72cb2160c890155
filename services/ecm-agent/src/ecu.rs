//! ECU gateway over TCP sessions.
//!
//! Each ECU connects to the agent's listener and announces itself with
//! `EcuFrame::Hello { ecu_id }`. From then on the session carries commands to
//! the ECU and acknowledgments back to the coordinator. Commands are routed to
//! the session whose ECU id equals the command's `reference`.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ecm_messages::{EcuCommand, EcuFrame, EcuId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::actors::CoordinatorHandle;
use crate::gateway::EcuGateway;
use crate::transport::{FrameReader, FrameWriter, TransportError};

/// Commands queued per ECU before delivery fails.
const SESSION_QUEUE: usize = 64;

/// How long a new connection may take to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Connected ECU sessions, keyed by ECU id.
pub struct EcuRegistry {
    sessions: RwLock<HashMap<EcuId, mpsc::Sender<EcuCommand>>>,

    /// Connected ids, for tasks waiting on a particular ECU.
    connected_tx: watch::Sender<BTreeSet<EcuId>>,
}

impl Default for EcuRegistry {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connected_tx: watch::channel(BTreeSet::new()).0,
        }
    }
}

impl EcuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route commands for `ecu_id` to `tx`, replacing any earlier session.
    pub async fn register(&self, ecu_id: EcuId, tx: mpsc::Sender<EcuCommand>) {
        if self.sessions.write().await.insert(ecu_id, tx).is_some() {
            warn!(ecu_id, "ECU reconnected; replacing previous session");
        }
        self.connected_tx.send_modify(|ids| {
            ids.insert(ecu_id);
        });
    }

    /// Remove the session for `ecu_id` if it is still `tx`.
    pub async fn unregister(&self, ecu_id: EcuId, tx: &mpsc::Sender<EcuCommand>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&ecu_id) {
            Some(current) if current.same_channel(tx) => {
                sessions.remove(&ecu_id);
                self.connected_tx.send_modify(|ids| {
                    ids.remove(&ecu_id);
                });
                true
            }
            _ => false,
        }
    }

    /// Wait until `ecu_id` has a session.
    pub async fn wait_connected(&self, ecu_id: EcuId) {
        let mut rx = self.connected_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ids| ids.contains(&ecu_id)).await;
    }

    /// Ids of connected ECUs, ascending.
    pub async fn connected(&self) -> Vec<EcuId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl EcuGateway for EcuRegistry {
    async fn send(&self, command: EcuCommand) -> Result<()> {
        let reference = command.reference();
        let sessions = self.sessions.read().await;
        let tx = sessions
            .get(&reference)
            .ok_or_else(|| anyhow!("ECU {reference} is not connected"))?;

        // Never wait on a slow ECU: the caller is the coordinator.
        tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("ECU {reference} command queue is full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("ECU {reference} session has closed"),
        })
    }
}

/// Accept ECU connections until shutdown.
pub async fn run_ecu_listener(
    listener: TcpListener,
    registry: Arc<EcuRegistry>,
    coordinator: CoordinatorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "ECU listener started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("ECU listener shutting down");
                    return Ok(());
                }
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept ECU connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                }

                let registry = Arc::clone(&registry);
                let coordinator = coordinator.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let session = serve_ecu_session(stream, peer, registry, coordinator, shutdown);
                    if let Err(e) = session.await {
                        warn!(peer = %peer, error = %e, "ECU session ended with error");
                    }
                });
            }
        }
    }
}

/// Serve one ECU connection until it closes or shutdown is signaled.
pub async fn serve_ecu_session<S>(
    stream: S,
    peer: SocketAddr,
    registry: Arc<EcuRegistry>,
    coordinator: CoordinatorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let ecu_id = match tokio::time::timeout(HELLO_TIMEOUT, reader.next::<EcuFrame>()).await {
        Ok(Ok(Some(EcuFrame::Hello { ecu_id }))) => ecu_id,
        Ok(Ok(Some(EcuFrame::Ack(ack)))) => {
            return Err(TransportError::Protocol(format!(
                "expected hello, got {}",
                ack.kind()
            )));
        }
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(TransportError::Protocol("hello timed out".to_string())),
    };

    let (tx, mut rx) = mpsc::channel::<EcuCommand>(SESSION_QUEUE);
    registry.register(ecu_id, tx.clone()).await;
    info!(ecu_id, peer = %peer, "ECU connected");

    let writer_task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let kind = command.kind();
            if let Err(e) = writer.send(&command).await {
                warn!(ecu_id, kind, error = %e, "Failed to write command to ECU");
                break;
            }
            debug!(ecu_id, kind, "Command delivered to ECU");
        }
    });

    let result = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Ok(());
                }
            }

            frame = reader.next::<EcuFrame>() => match frame {
                Ok(Some(EcuFrame::Ack(ack))) => {
                    debug!(ecu_id, kind = ack.kind(), "Received ECU message");
                    if coordinator.ack(ack).await.is_err() {
                        error!(ecu_id, "Coordinator has stopped; closing ECU session");
                        break Ok(());
                    }
                }
                Ok(Some(EcuFrame::Hello { ecu_id: again })) => {
                    warn!(ecu_id, announced = again, "Ignoring repeated hello");
                }
                Ok(None) => break Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!(ecu_id, error = %e, "Dropping undecodable ECU frame");
                }
                Err(e) => break Err(e),
            }
        }
    };

    registry.unregister(ecu_id, &tx).await;
    writer_task.abort();
    info!(ecu_id, peer = %peer, "ECU disconnected");

    result
}
