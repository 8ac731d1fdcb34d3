//! Wire protocol shared by the hub server and its clients.
//!
//! Every frame on the real-time endpoint is one bincode-encoded packet inside a
//! binary WebSocket message. Payloads are opaque to the hub: it only reads the
//! routing metadata around them.

use serde::{Deserialize, Serialize};

/// Identifier the hub assigns to a client when it registers.
pub type ClientId = u32;

/// Path the server upgrades to the real-time transport by default.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Query parameter carrying the optional client identity on upgrade.
pub const IDENTITY_PARAM: &str = "identity";

/// Error raised when a packet cannot be encoded or decoded.
pub type CodecError = bincode::Error;

/// Who should receive a packet sent by a client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every registered client, the sender only when `include_self` is set.
    Broadcast { include_self: bool },
    /// Exactly one client. Dropped silently if it is not connected.
    Client(ClientId),
}

impl Default for Target {
    fn default() -> Self {
        Target::Broadcast {
            include_self: false,
        }
    }
}

/// Packet sent from a client to the hub.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientPacket {
    pub target: Target,
    pub payload: Vec<u8>,
}

impl ClientPacket {
    pub fn broadcast(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: Target::default(),
            payload: payload.into(),
        }
    }

    pub fn to_client(client_id: ClientId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: Target::Client(client_id),
            payload: payload.into(),
        }
    }

    /// Broadcast that is echoed back to the sender as well.
    pub fn broadcast_all(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: Target::Broadcast { include_self: true },
            payload: payload.into(),
        }
    }
}

/// Packet sent from the hub to a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    /// First packet after registration, tells the client its id.
    Connected { client_id: ClientId },
    /// A payload routed from another client (or from the receiver itself).
    Message { sender: ClientId, payload: Vec<u8> },
    /// The hub is about to close this connection.
    Disconnected { reason: String },
}

/// Serializes a packet into the bytes of one binary frame.
pub fn encode<T: Serialize>(packet: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(packet)
}

/// Deserializes one binary frame. Fails on truncated or foreign data.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes)
}
