//! Transport-agnostic connection abstraction.
//!
//! The hub and its client pumps only ever talk to a [`Connection`]. Concrete
//! transports live in submodules and are produced by a [`ConnectionFactory`],
//! which performs whatever upgrade handshake the transport needs:
//!
//! - [`websocket`]: WebSocket over any async byte stream (TCP in production)
//! - [`memory`]: channel-backed connections for tests and embedding

pub mod memory;
pub mod websocket;

use crate::error::{ConnectionError, HubError};
use async_trait::async_trait;
use shared::{ClientPacket, ServerPacket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One duplex message channel to a remote client.
///
/// `read` and `write` may run concurrently from different tasks. `close` is
/// idempotent; once it has been called any pending or future `read`/`write`
/// fails with [`ConnectionError::Closed`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Waits for the next packet from the remote side.
    async fn read(&self) -> Result<ClientPacket, ConnectionError>;

    /// Delivers one packet to the remote side.
    async fn write(&self, packet: &ServerPacket) -> Result<(), ConnectionError>;

    /// Releases the transport. Calling it more than once has no effect.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once `close` has been called, by anyone.
    async fn closed(&self);
}

/// Result of a successful transport upgrade.
pub struct Upgraded {
    pub connection: Arc<dyn Connection>,
    /// Identity the client asked for during the handshake, if any.
    pub identity: Option<String>,
}

/// Turns a raw transport request into a [`Connection`].
///
/// `R` is whatever the transport starts from: an accepted TCP stream for
/// WebSocket, a prepared endpoint for the in-memory transport.
#[async_trait]
pub trait ConnectionFactory<R>: Send + Sync
where
    R: Send + 'static,
{
    async fn upgrade(&self, request: R) -> Result<Upgraded, HubError>;
}

/// One-shot close flag that wakes every task waiting on it.
#[derive(Debug, Default)]
pub(crate) struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    /// Marks the signal closed. Returns `true` only for the call that closed it.
    pub(crate) fn trigger(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`CloseSignal::trigger`] has been called.
    pub(crate) async fn closed(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // trigger cannot slip between the check and the wait.
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}
