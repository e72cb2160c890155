//! Session with the trusted server.
//!
//! The agent dials the server, announces itself with `Init { vin }` and then
//! runs two directions independently:
//! - a reader task hands inbound batches to the unpack worker
//! - the session loop drains the outbound queue fed by `QueuedChannel`
//!
//! Keeping the directions apart means the outbound queue is drained even while
//! the unpack worker waits on the coordinator. A packet whose write fails is
//! retried first after reconnecting.

use std::time::Duration;

use anyhow::{Context, Result};
use ecm_messages::ServerPacket;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::actors::BackoffPolicy;
use crate::transport::{FrameReader, FrameWriter, TransportError};
use crate::unpack::Unpacker;

/// Timeout for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was signaled.
    Shutdown,
    /// Every producer of outbound packets is gone.
    Closed,
    /// The peer closed the connection.
    Disconnected,
}

/// Connect to `addr`, honoring the shutdown signal. `Ok(None)` means shutdown.
pub async fn connect(
    addr: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<TcpStream>> {
    tokio::select! {
        changed = shutdown.changed() => {
            if changed.is_err() || *shutdown.borrow() {
                return Ok(None);
            }
            Err(anyhow::anyhow!("connect to {addr} interrupted"))
        }
        result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => {
            let stream = result
                .with_context(|| format!("timed out connecting to {addr}"))?
                .with_context(|| format!("failed to connect to {addr}"))?;
            stream.set_nodelay(true).ok();
            Ok(Some(stream))
        }
    }
}

/// Sleep for the backoff delay. Returns `false` if shutdown was signaled.
pub async fn backoff_wait(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Trusted-server session with reconnects.
pub struct UplinkSession {
    addr: String,
    vin: String,
    backoff: BackoffPolicy,

    /// Packets from the coordinator and unpacker.
    outbound: mpsc::Receiver<ServerPacket>,

    /// Batches for the unpack worker.
    inbound: mpsc::Sender<ServerPacket>,

    /// Packet whose write failed, sent first on the next connection.
    pending: Option<ServerPacket>,
}

impl UplinkSession {
    pub fn new(
        addr: String,
        vin: String,
        backoff: BackoffPolicy,
        outbound: mpsc::Receiver<ServerPacket>,
        inbound: mpsc::Sender<ServerPacket>,
    ) -> Self {
        Self {
            addr,
            vin,
            backoff,
            outbound,
            inbound,
            pending: None,
        }
    }

    /// Keep a session up until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.addr, "Starting trusted server session");
        let mut attempt = 0u32;

        loop {
            match connect(&self.addr, &mut shutdown).await {
                Ok(None) => return Ok(()),
                Ok(Some(stream)) => {
                    info!(addr = %self.addr, "Connected to trusted server");
                    attempt = 0;
                    match self.serve(stream, &mut shutdown).await {
                        Ok(SessionEnd::Shutdown) | Ok(SessionEnd::Closed) => return Ok(()),
                        Ok(SessionEnd::Disconnected) => {
                            warn!(addr = %self.addr, "Trusted server closed the connection");
                        }
                        Err(e) => {
                            warn!(addr = %self.addr, error = %e, "Trusted server session failed");
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Trusted server unreachable");
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to trusted server");
            if !backoff_wait(delay, &mut shutdown).await {
                return Ok(());
            }
        }
    }

    /// Serve one connection.
    pub async fn serve<S>(
        &mut self,
        stream: S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(write_half);

        writer
            .send(&ServerPacket::Init {
                vin: self.vin.clone(),
            })
            .await?;

        let mut reader_task = tokio::spawn(read_batches(
            FrameReader::new(read_half),
            self.inbound.clone(),
        ));

        let end = loop {
            if self.pending.is_none() {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break Ok(SessionEnd::Shutdown);
                        }
                        continue;
                    }

                    _ = &mut reader_task => break Ok(SessionEnd::Disconnected),

                    packet = self.outbound.recv() => match packet {
                        Some(packet) => self.pending = Some(packet),
                        None => break Ok(SessionEnd::Closed),
                    },
                }
            }

            if let Some(packet) = &self.pending {
                if let Err(e) = writer.send(packet).await {
                    break Err(e);
                }
                debug!(kind = packet.kind(), "Sent packet to trusted server");
                self.pending = None;
            }
        };

        reader_task.abort();
        end
    }
}

/// Forward decoded batches until the connection or the worker goes away.
async fn read_batches<R>(mut reader: FrameReader<R>, inbound: mpsc::Sender<ServerPacket>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next::<ServerPacket>().await {
            Ok(Some(packet)) => {
                debug!(kind = packet.kind(), "Received packet from trusted server");
                if inbound.send(packet).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Dropping undecodable trusted server frame");
            }
            Err(e) => {
                warn!(error = %e, "Trusted server read failed");
                return;
            }
        }
    }
}

/// Unpack inbound batches one at a time until shutdown.
pub async fn run_unpack_worker(
    unpacker: Unpacker,
    mut inbound: mpsc::Receiver<ServerPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    unpacker.unpack(packet).await;
                }
                None => break,
            },
        }
    }
    debug!("Unpack worker stopped");
}
