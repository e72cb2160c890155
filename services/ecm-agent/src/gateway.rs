//! Outbound channel interfaces and in-process implementations.
//!
//! The coordinator talks to three downstream actors through these traits:
//! - `EcuGateway`: commands to execution units
//! - `TrustedChannel`: packets to the trusted server
//! - `TelemetryChannel`: publish packets to the IoT endpoint
//!
//! `QueuedChannel` backs the network sessions; the mock implementations
//! record everything they are given, for tests and local development.

use anyhow::Result;
use async_trait::async_trait;
use ecm_messages::{EcuCommand, IotPacket, ServerPacket};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Delivers commands to execution units.
#[async_trait]
pub trait EcuGateway: Send + Sync {
    /// Deliver a command to the ECU named by `command.reference()`.
    async fn send(&self, command: EcuCommand) -> Result<()>;
}

/// Sends packets to the trusted server.
#[async_trait]
pub trait TrustedChannel: Send + Sync {
    async fn send(&self, packet: ServerPacket) -> Result<()>;
}

/// Sends telemetry to the IoT endpoint.
#[async_trait]
pub trait TelemetryChannel: Send + Sync {
    async fn publish(&self, packet: IotPacket) -> Result<()>;
}

/// Channel that hands packets to a session task through a bounded queue.
///
/// Packets queue up while the session is reconnecting.
#[derive(Debug, Clone)]
pub struct QueuedChannel<T> {
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> QueuedChannel<T> {
    /// Create a channel and the receiver its session task drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn enqueue(&self, item: T) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| anyhow::anyhow!("session task has stopped"))
    }
}

#[async_trait]
impl TrustedChannel for QueuedChannel<ServerPacket> {
    async fn send(&self, packet: ServerPacket) -> Result<()> {
        debug!(kind = packet.kind(), "Queueing trusted server packet");
        self.enqueue(packet).await
    }
}

#[async_trait]
impl TelemetryChannel for QueuedChannel<IotPacket> {
    async fn publish(&self, packet: IotPacket) -> Result<()> {
        self.enqueue(packet).await
    }
}

/// Mock ECU gateway recording every command.
#[derive(Default)]
pub struct MockEcuGateway {
    sent: Mutex<Vec<EcuCommand>>,
    fail_sends: bool,
}

impl MockEcuGateway {
    /// Create a new mock gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock gateway that rejects every command.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    /// Commands delivered so far.
    pub async fn sent(&self) -> Vec<EcuCommand> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl EcuGateway for MockEcuGateway {
    async fn send(&self, command: EcuCommand) -> Result<()> {
        if self.fail_sends {
            anyhow::bail!("ECU {} is not connected", command.reference());
        }
        debug!(kind = command.kind(), reference = command.reference(), "[MOCK] ECU command");
        self.sent.lock().await.push(command);
        Ok(())
    }
}

/// Mock trusted server recording every packet.
#[derive(Default)]
pub struct MockTrustedChannel {
    sent: Mutex<Vec<ServerPacket>>,
}

impl MockTrustedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets sent so far.
    pub async fn sent(&self) -> Vec<ServerPacket> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl TrustedChannel for MockTrustedChannel {
    async fn send(&self, packet: ServerPacket) -> Result<()> {
        self.sent.lock().await.push(packet);
        Ok(())
    }
}

/// Mock IoT endpoint recording every packet.
#[derive(Default)]
pub struct MockTelemetryChannel {
    published: Mutex<Vec<IotPacket>>,
}

impl MockTelemetryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets published so far.
    pub async fn published(&self) -> Vec<IotPacket> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl TelemetryChannel for MockTelemetryChannel {
    async fn publish(&self, packet: IotPacket) -> Result<()> {
        self.published.lock().await.push(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_channel_delivers_in_order() {
        let (channel, mut rx) = QueuedChannel::<ServerPacket>::new(4);

        channel
            .send(ServerPacket::Init {
                vin: "VIN1".to_string(),
            })
            .await
            .unwrap();
        channel
            .send(ServerPacket::RestoreAck {
                vin: "VIN1".to_string(),
                plugin_name: "a".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "init");
        assert_eq!(rx.recv().await.unwrap().kind(), "restore_ack");
    }

    #[tokio::test]
    async fn test_queued_channel_fails_after_session_stops() {
        let (channel, rx) = QueuedChannel::<IotPacket>::new(1);
        drop(rx);

        let result = channel
            .publish(IotPacket::Publish {
                key: "k".to_string(),
                value: "v".to_string(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_failing_mock_gateway() {
        let gateway = MockEcuGateway::failing();
        let result = gateway
            .send(EcuCommand::Power {
                reference: 2,
                value: 1,
            })
            .await;
        assert!(result.is_err());
        assert!(gateway.sent().await.is_empty());
    }
}
