//! WebSocket transport built on tokio-tungstenite.
//!
//! Each packet travels as one binary frame holding a bincode-encoded
//! [`ClientPacket`] or [`ServerPacket`].

use super::{CloseSignal, Connection, ConnectionFactory, Upgraded};
use crate::error::{ConnectionError, HubError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use shared::{ClientPacket, ServerPacket, DEFAULT_WS_PATH, IDENTITY_PARAM};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// Upper bound on how long a close handshake may take before the stream is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// A [`Connection`] over an upgraded WebSocket stream.
pub struct WebSocketConnection<S> {
    reader: Mutex<SplitStream<WebSocketStream<S>>>,
    writer: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    signal: CloseSignal,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a stream whose handshake has already completed.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (writer, reader) = stream.split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            signal: CloseSignal::default(),
        }
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self) -> Result<ClientPacket, ConnectionError> {
        if self.signal.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut reader = self.reader.lock().await;
        loop {
            let frame = tokio::select! {
                _ = self.signal.closed() => return Err(ConnectionError::Closed),
                frame = reader.next() => frame,
            };

            match frame {
                Some(Ok(Message::Binary(bytes))) => match shared::decode::<ClientPacket>(&bytes) {
                    Ok(packet) => return Ok(packet),
                    Err(e) => warn!("Failed to decode packet ({} bytes): {}", bytes.len(), e),
                },
                Some(Ok(Message::Text(_))) => {
                    warn!("Ignoring text frame, packets must be sent as binary frames");
                }
                Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::Closed),
                // Ping/pong bookkeeping is done by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport_error(e)),
            }
        }
    }

    async fn write(&self, packet: &ServerPacket) -> Result<(), ConnectionError> {
        if self.signal.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let bytes =
            shared::encode(packet).map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.signal.closed() => Err(ConnectionError::Closed),
            result = writer.send(Message::Binary(bytes.into())) => result.map_err(transport_error),
        }
    }

    async fn close(&self) {
        if !self.signal.trigger() {
            return;
        }

        // Any in-flight write has been cancelled by the trigger above, so the
        // writer lock frees up promptly.
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close handshake failed: {}", e),
            Err(_) => debug!("Close handshake timed out after {:?}", CLOSE_TIMEOUT),
        }
    }

    fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    async fn closed(&self) {
        self.signal.closed().await
    }
}

fn transport_error(error: WsError) -> ConnectionError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ConnectionError::Closed,
        other => ConnectionError::Transport(other.to_string()),
    }
}

/// Upgrades raw byte streams to WebSocket connections on a single path.
///
/// Requests for any other path are answered with `404 Not Found` and surface
/// as [`HubError::TransportUpgradeFailed`].
#[derive(Debug, Clone)]
pub struct WebSocketFactory {
    path: String,
}

impl WebSocketFactory {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Path this factory upgrades, e.g. `/ws`.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Default for WebSocketFactory {
    fn default() -> Self {
        Self::new(DEFAULT_WS_PATH)
    }
}

#[async_trait]
impl<S> ConnectionFactory<S> for WebSocketFactory
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn upgrade(&self, stream: S) -> Result<Upgraded, HubError> {
        let mut identity = None;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let uri = request.uri();
            debug!(
                "Upgrade request for '{}', Host={}, X-Forwarded-Proto={}",
                uri.path(),
                header(request, "host"),
                header(request, "x-forwarded-proto"),
            );

            if uri.path() != self.path {
                return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
            }

            identity = identity_from_query(uri.query());
            Ok(response)
        };

        let stream = accept_hdr_async(stream, callback)
            .await
            .map_err(|e| HubError::TransportUpgradeFailed(e.to_string()))?;

        Ok(Upgraded {
            connection: Arc::new(WebSocketConnection::new(stream)),
            identity,
        })
    }
}

fn header<'a>(request: &'a Request, name: &str) -> &'a str {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Extracts a non-empty, form-decoded `identity` parameter from a request
/// query string.
fn identity_from_query(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == IDENTITY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
