//! In-process transport backed by tokio channels.
//!
//! [`MemoryConnection::pair`] returns the hub-side connection and a
//! [`MemoryPeer`] that plays the remote client. The peer's inbox is bounded,
//! so a peer that stops reading behaves like a stalled network client.

use super::{CloseSignal, Connection, ConnectionFactory, Upgraded};
use crate::error::{ConnectionError, HubError};
use async_trait::async_trait;
use shared::{ClientPacket, ServerPacket};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Hub side of an in-process connection.
pub struct MemoryConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<ClientPacket>>,
    outbound: mpsc::Sender<ServerPacket>,
    identity: Option<String>,
    signal: Arc<CloseSignal>,
}

impl MemoryConnection {
    /// Creates a connected pair. `peer_capacity` bounds how many packets the
    /// peer may leave unread before writes start to wait.
    pub fn pair(peer_capacity: usize) -> (MemoryConnection, MemoryPeer) {
        let (to_hub, inbound) = mpsc::unbounded_channel();
        let (outbound, from_hub) = mpsc::channel(peer_capacity.max(1));
        let signal = Arc::new(CloseSignal::default());

        let connection = MemoryConnection {
            inbound: Mutex::new(inbound),
            outbound,
            identity: None,
            signal: Arc::clone(&signal),
        };
        let peer = MemoryPeer {
            to_hub: Some(to_hub),
            from_hub,
            signal,
        };
        (connection, peer)
    }

    /// Identity reported to the hub when this connection is upgraded.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read(&self) -> Result<ClientPacket, ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.signal.closed() => Err(ConnectionError::Closed),
            packet = inbound.recv() => packet.ok_or(ConnectionError::Closed),
        }
    }

    async fn write(&self, packet: &ServerPacket) -> Result<(), ConnectionError> {
        tokio::select! {
            _ = self.signal.closed() => Err(ConnectionError::Closed),
            result = self.outbound.send(packet.clone()) => {
                result.map_err(|_| ConnectionError::Closed)
            }
        }
    }

    async fn close(&self) {
        self.signal.trigger();
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    async fn closed(&self) {
        self.signal.closed().await
    }
}

/// The remote end of a [`MemoryConnection`].
pub struct MemoryPeer {
    to_hub: Option<mpsc::UnboundedSender<ClientPacket>>,
    from_hub: mpsc::Receiver<ServerPacket>,
    signal: Arc<CloseSignal>,
}

impl MemoryPeer {
    /// Sends a packet to the hub as if it came over the wire.
    pub fn send(&self, packet: ClientPacket) -> Result<(), ConnectionError> {
        if self.signal.is_closed() {
            return Err(ConnectionError::Closed);
        }
        match &self.to_hub {
            Some(to_hub) => to_hub.send(packet).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    /// Next packet from the hub, or `None` once the hub side is gone.
    pub async fn recv(&mut self) -> Option<ServerPacket> {
        self.from_hub.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerPacket> {
        self.from_hub.try_recv().ok()
    }

    /// Simulates the remote client going away: the hub's next read fails.
    pub fn disconnect(&mut self) {
        self.to_hub = None;
    }

    /// Simulates a broken outbound path: the hub's next write fails while
    /// reads keep working.
    pub fn fail_writes(&mut self) {
        self.from_hub.close();
    }

    /// Whether the hub side has closed this connection.
    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    /// Resolves once the hub side has closed this connection.
    pub async fn closed(&self) {
        self.signal.closed().await
    }
}

/// Factory for [`MemoryConnection`]s; the upgrade only hands the connection over.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryFactory;

#[async_trait]
impl ConnectionFactory<MemoryConnection> for MemoryFactory {
    async fn upgrade(&self, mut connection: MemoryConnection) -> Result<Upgraded, HubError> {
        if connection.is_closed() {
            return Err(HubError::TransportUpgradeFailed(
                "connection already closed".to_string(),
            ));
        }

        let identity = connection.identity.take();
        Ok(Upgraded {
            connection: Arc::new(connection),
            identity,
        })
    }
}
