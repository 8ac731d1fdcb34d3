//! The hub's view of one connected participant and the two tasks that drive it.
//!
//! Every registered client owns:
//! - a [`Connection`] shared with its pumps
//! - a bounded outbox the hub fills and the writer pump drains
//! - a reader pump forwarding inbound packets to the hub
//! - a writer pump delivering outbound packets to the connection
//!
//! Pumps never talk to each other. When either one hits the end of its I/O it
//! asks the hub to unregister the client, and the hub tears down both.

use crate::connection::{Connection, Upgraded};
use crate::error::ConnectionError;
use crate::hub::HubEvent;
use log::{debug, warn};
use shared::{ClientId, ServerPacket};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Lifecycle of a client inside the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, pumps not started yet.
    Connecting,
    /// Registered and exchanging packets.
    Active,
    /// Outbox closed, connection close in progress.
    Closing,
    /// Connection released.
    Closed,
}

/// Outcome of queueing a packet for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbox at capacity, the packet was dropped.
    Full,
    /// Outbox already closed, the client is being torn down.
    Closed,
}

/// Receiving half of a client's outbox, drained by its writer pump.
pub type Outbox = mpsc::Receiver<Arc<ServerPacket>>;

/// A registered participant. Only the hub's coordination loop holds these.
pub struct Client {
    id: ClientId,
    identity: Option<String>,
    connection: Arc<dyn Connection>,
    outbox: Option<mpsc::Sender<Arc<ServerPacket>>>,
    state: ClientState,
}

impl Client {
    /// Creates a client in the `Connecting` state together with the receiving
    /// half of its outbox.
    pub fn new(id: ClientId, upgraded: Upgraded, outbox_capacity: usize) -> (Self, Outbox) {
        let (sender, receiver) = mpsc::channel(outbox_capacity.max(1));
        let client = Self {
            id,
            identity: upgraded.identity,
            connection: upgraded.connection,
            outbox: Some(sender),
            state: ClientState::Connecting,
        };
        (client, receiver)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Identity given at upgrade time, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Current lifecycle state. A closing client reads as `Closed` once its
    /// connection has been released.
    pub fn state(&self) -> ClientState {
        if self.state == ClientState::Closing && self.connection.is_closed() {
            ClientState::Closed
        } else {
            self.state
        }
    }

    /// Spawns the reader and writer pumps and marks the client active.
    pub(crate) fn start(&mut self, outbox: Outbox, events: mpsc::UnboundedSender<HubEvent>) {
        tokio::spawn(read_pump(
            self.id,
            Arc::clone(&self.connection),
            events.clone(),
        ));
        tokio::spawn(write_pump(
            self.id,
            Arc::clone(&self.connection),
            outbox,
            events,
        ));
        self.state = ClientState::Active;
    }

    /// Queues a packet without waiting. A slow client only loses its own packets.
    pub fn enqueue(&self, packet: Arc<ServerPacket>) -> Delivery {
        let Some(outbox) = &self.outbox else {
            return Delivery::Closed;
        };
        match outbox.try_send(packet) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Closes the outbox and hands back the connection so the caller can
    /// close it wherever awaiting is acceptable.
    pub fn begin_close(&mut self) -> Arc<dyn Connection> {
        self.outbox = None;
        self.state = ClientState::Closing;
        Arc::clone(&self.connection)
    }
}

/// Forwards packets from the connection to the hub until the connection ends.
async fn read_pump(
    id: ClientId,
    connection: Arc<dyn Connection>,
    events: mpsc::UnboundedSender<HubEvent>,
) {
    loop {
        match connection.read().await {
            Ok(packet) => {
                if events.send(HubEvent::Inbound { sender: id, packet }).is_err() {
                    debug!("Hub gone, stopping reader for client {}", id);
                    return;
                }
            }
            Err(e) => {
                match e {
                    ConnectionError::Closed => debug!("Client {} connection closed", id),
                    ConnectionError::Transport(reason) => {
                        warn!("Read error on client {}: {}", id, reason)
                    }
                }
                let _ = events.send(HubEvent::Unregister(id));
                return;
            }
        }
    }
}

/// Drains the outbox into the connection. Exits when the hub closes the
/// outbox, closing the connection on the way out.
async fn write_pump(
    id: ClientId,
    connection: Arc<dyn Connection>,
    mut outbox: Outbox,
    events: mpsc::UnboundedSender<HubEvent>,
) {
    while let Some(packet) = outbox.recv().await {
        if let Err(e) = connection.write(&packet).await {
            match e {
                ConnectionError::Closed => debug!("Client {} closed while writing", id),
                ConnectionError::Transport(reason) => {
                    warn!("Write error on client {}: {}", id, reason)
                }
            }
            let _ = events.send(HubEvent::Unregister(id));
            return;
        }
    }

    connection.close().await;
    debug!("Writer for client {} finished", id);
}
