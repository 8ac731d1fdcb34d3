//! WebSocket connection to the hub from the client side.

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientId, ClientPacket, CodecError, ServerPacket, DEFAULT_WS_PATH, IDENTITY_PARAM};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Errors raised by [`HubClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection closed by server")]
    Closed,
}

/// Builds the real-time endpoint URL for `address` (`host:port`).
///
/// The identity is form-encoded, so reserved characters such as `&`, `%` or
/// spaces reach the hub unchanged.
pub fn endpoint_url(address: &str, identity: Option<&str>) -> String {
    match identity {
        Some(identity) => {
            let query = form_urlencoded::Serializer::new(String::new())
                .append_pair(IDENTITY_PARAM, identity)
                .finish();
            format!("ws://{}{}?{}", address, DEFAULT_WS_PATH, query)
        }
        None => format!("ws://{}{}", address, DEFAULT_WS_PATH),
    }
}

/// A connection to the hub's real-time endpoint.
///
/// The hub's first packet is always `Connected`; call
/// [`HubClient::wait_connected`] before relying on [`HubClient::client_id`].
pub struct HubClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    client_id: Option<ClientId>,
    fake_ping_ms: u64,
    /// Packet already read off the socket, held until its simulated latency
    /// has passed.
    pending: Option<(Instant, ServerPacket)>,
}

impl HubClient {
    /// Connects to the hub at `address` (`host:port`) on the default path.
    pub async fn connect(address: &str, identity: Option<&str>) -> Result<Self, ClientError> {
        Self::connect_url(&endpoint_url(address, identity)).await
    }

    /// Connects to a full `ws://` URL. Identity, if any, must already be in
    /// its query string.
    pub async fn connect_url(url: &str) -> Result<Self, ClientError> {
        info!("Connecting to {}...", url);
        let (stream, _response) = connect_async(url).await?;
        Ok(Self {
            stream,
            client_id: None,
            fake_ping_ms: 0,
            pending: None,
        })
    }

    /// Delays every send and receive by half of `fake_ping_ms`.
    pub fn with_fake_ping(mut self, fake_ping_ms: u64) -> Self {
        self.fake_ping_ms = fake_ping_ms;
        self
    }

    /// Id assigned by the hub, once the welcome packet has been received.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    /// Sends one packet as a binary frame.
    pub async fn send(&mut self, packet: &ClientPacket) -> Result<(), ClientError> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = shared::encode(packet)?;
        self.stream.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    /// Waits for the next packet from the hub.
    ///
    /// Cancel safe: a packet read from the socket is kept until it is
    /// returned, even if the call is dropped during the simulated latency.
    pub async fn recv(&mut self) -> Result<ServerPacket, ClientError> {
        if self.pending.is_none() {
            let packet = self.read_packet().await?;
            let due = Instant::now() + Duration::from_millis(self.fake_ping_ms / 2);
            self.pending = Some((due, packet));
        }

        if let Some((due, _)) = &self.pending {
            sleep_until(*due).await;
        }

        match self.pending.take() {
            Some((_, packet)) => {
                self.handle_packet(&packet);
                Ok(packet)
            }
            None => Err(ClientError::Closed),
        }
    }

    async fn read_packet(&mut self) -> Result<ServerPacket, ClientError> {
        loop {
            let message = match self.stream.next().await {
                Some(message) => message?,
                None => return Err(ClientError::Closed),
            };

            match message {
                Message::Binary(bytes) => return Ok(shared::decode(&bytes)?),
                Message::Close(_) => return Err(ClientError::Closed),
                other => debug!("Ignoring non-binary frame: {:?}", other),
            }
        }
    }

    /// Reads until the welcome packet arrives and returns the assigned id.
    pub async fn wait_connected(&mut self) -> Result<ClientId, ClientError> {
        if let Some(client_id) = self.client_id {
            return Ok(client_id);
        }
        loop {
            if let ServerPacket::Connected { client_id } = self.recv().await? {
                return Ok(client_id);
            }
        }
    }

    /// Performs the WebSocket close handshake. A server that already hung up
    /// is not an error.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn handle_packet(&mut self, packet: &ServerPacket) {
        match packet {
            ServerPacket::Connected { client_id } => {
                info!("Connected! Client ID: {}", client_id);
                self.client_id = Some(*client_id);
            }
            ServerPacket::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.client_id = None;
            }
            ServerPacket::Message { .. } => {}
        }
    }
}
