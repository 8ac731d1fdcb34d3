//! Error types for the hub, its connections and game data loading.

use std::path::PathBuf;

/// Errors surfaced to callers of the hub's entry points.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The transport handshake did not complete; no client was created.
    #[error("transport upgrade failed: {0}")]
    TransportUpgradeFailed(String),

    /// Every client id has been handed out; the connection was refused.
    #[error("client ids exhausted")]
    IdsExhausted,

    /// The coordination loop is no longer running.
    #[error("hub is stopped")]
    Stopped,
}

/// End of a connection's I/O, normal or not.
///
/// Pumps treat both variants the same way: the client gets unregistered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
