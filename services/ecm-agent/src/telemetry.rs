//! Session with the IoT collection endpoint.
//!
//! Publish packets relayed from ECUs are queued by `QueuedChannel` and
//! written here. The endpoint never sends anything back.

use anyhow::Result;
use ecm_messages::IotPacket;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::actors::BackoffPolicy;
use crate::transport::{FrameWriter, TransportError};
use crate::uplink::{backoff_wait, connect, SessionEnd};

/// IoT session with reconnects.
pub struct TelemetrySession {
    addr: String,
    backoff: BackoffPolicy,
    outbound: mpsc::Receiver<IotPacket>,

    /// Packet whose write failed, sent first on the next connection.
    pending: Option<IotPacket>,

    published: u64,
}

impl TelemetrySession {
    pub fn new(addr: String, backoff: BackoffPolicy, outbound: mpsc::Receiver<IotPacket>) -> Self {
        Self {
            addr,
            backoff,
            outbound,
            pending: None,
            published: 0,
        }
    }

    /// Keep a session up until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.addr, "Starting IoT session");
        let mut attempt = 0u32;

        loop {
            match connect(&self.addr, &mut shutdown).await {
                Ok(None) => break,
                Ok(Some(stream)) => {
                    info!(addr = %self.addr, "Connected to IoT server");
                    attempt = 0;
                    match self.serve(stream, &mut shutdown).await {
                        Ok(SessionEnd::Disconnected) => {}
                        Ok(_) => break,
                        Err(e) => warn!(addr = %self.addr, error = %e, "IoT session failed"),
                    }
                }
                Err(e) => warn!(attempt, error = %e, "IoT server unreachable"),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            if !backoff_wait(delay, &mut shutdown).await {
                break;
            }
        }

        info!(published = self.published, "IoT session stopped");
        Ok(())
    }

    /// Drain the queue into one connection.
    pub async fn serve<W>(
        &mut self,
        stream: W,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut writer = FrameWriter::new(stream);

        loop {
            if self.pending.is_none() {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return Ok(SessionEnd::Shutdown);
                        }
                        continue;
                    }

                    packet = self.outbound.recv() => match packet {
                        Some(packet) => self.pending = Some(packet),
                        None => return Ok(SessionEnd::Closed),
                    },
                }
            }

            if let Some(packet) = &self.pending {
                writer.send(packet).await?;
                self.published += 1;
                debug!(published = self.published, "Published to IoT server");
                self.pending = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::transport::FrameReader;

    fn publish(key: &str) -> IotPacket {
        IotPacket::Publish {
            key: key.to_string(),
            value: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_session_writes_queued_packets_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut session = TelemetrySession::new("unused".to_string(), BackoffPolicy::default(), rx);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);

        tx.send(publish("a")).await.unwrap();
        tx.send(publish("b")).await.unwrap();
        drop(tx);

        let (agent_side, server_side) = tokio::io::duplex(4096);
        let end = session.serve(agent_side, &mut shutdown).await.unwrap();
        assert_eq!(end, SessionEnd::Closed);

        let mut reader = FrameReader::new(server_side);
        assert_eq!(reader.next::<IotPacket>().await.unwrap(), Some(publish("a")));
        assert_eq!(reader.next::<IotPacket>().await.unwrap(), Some(publish("b")));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_packet_for_next_connection() {
        let (tx, rx) = mpsc::channel(4);
        let mut session = TelemetrySession::new("unused".to_string(), BackoffPolicy::default(), rx);
        let (_shutdown_tx, mut shutdown) = watch::channel(false);
        tx.send(publish("kept")).await.unwrap();

        let (agent_side, server_side) = tokio::io::duplex(64);
        drop(server_side);
        assert!(session.serve(agent_side, &mut shutdown).await.is_err());

        drop(tx);
        let (agent_side, mut server_side) = tokio::io::duplex(4096);
        assert_eq!(
            session.serve(agent_side, &mut shutdown).await.unwrap(),
            SessionEnd::Closed
        );

        let mut received = String::new();
        server_side.read_to_string(&mut received).await.unwrap();
        assert!(received.contains("\"kept\""));
    }
}
