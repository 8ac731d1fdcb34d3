//! # Game Hub Server Library
//!
//! This library provides the connection hub of the multiplayer game server:
//! the component that accepts many concurrent real-time client connections,
//! tracks their lifecycle, and routes opaque game payloads between them.
//!
//! ## Core Responsibilities
//!
//! ### Connection Lifecycle
//! Every client goes through `Connecting -> Active -> Closing -> Closed`. A
//! client that fails on either side of its connection is unregistered, its
//! outbox closed, and its connection released. Failures never spread to other
//! clients.
//!
//! ### Message Routing
//! Clients send packets with routing metadata only: a broadcast (optionally
//! echoed to the sender) or a single target id. The hub never looks inside the
//! payload. Messages for a disconnected target are dropped silently.
//!
//! ### Game Data
//! On construction the hub loads the JSON documents of the server's data
//! directory. A missing directory is logged and the hub runs without data.
//!
//! ## Architecture Design
//!
//! ### Single Coordination Loop
//! The client map is owned by one task, [`Hub::run`]. Registration,
//! unregistration and routing all arrive as events on one channel and are
//! handled one at a time, so the map never needs a lock and registration and
//! unregistration of the same client can never be reordered.
//!
//! ### Two Pumps per Client
//! - **Reader pump**: reads packets from the connection and forwards them to
//!   the loop tagged with the client id
//! - **Writer pump**: drains the client's outbox into the connection
//!
//! ### Backpressure Isolation
//! Outboxes are bounded and filled with a non-blocking send. A client that
//! stops reading loses its own packets once its outbox is full; delivery to
//! everybody else continues at full speed.
//!
//! ### Transport Independence
//! The hub only knows the [`Connection`] and [`ConnectionFactory`] traits.
//! WebSocket is the production transport, an in-memory transport drives the
//! tests.
//!
//! ## Module Organization
//!
//! - `hub`: coordination loop, [`Hub`] and its [`HubHandle`]
//! - `client`: per-client state and pumps
//! - `dispatch`: recipient selection
//! - `connection`: transport abstraction plus WebSocket and in-memory transports
//! - `data`: game data loading
//! - `config`: hub tuning and data directory fallback
//! - `error`: error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::connection::websocket::WebSocketFactory;
//! use server::{Hub, HubConfig};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Hub::new("./data", HubConfig::default());
//!     let handle = hub.handle();
//!     tokio::spawn(hub.run());
//!
//!     let factory = std::sync::Arc::new(WebSocketFactory::default());
//!     let listener = TcpListener::bind("127.0.0.1:8081").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let handle = handle.clone();
//!         let factory = factory.clone();
//!         tokio::spawn(async move {
//!             let _ = handle.serve(factory.as_ref(), stream).await;
//!         });
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod hub;

pub use client::ClientState;
pub use config::HubConfig;
pub use connection::{Connection, ConnectionFactory, Upgraded};
pub use data::GameData;
pub use error::{ConnectionError, DataError, HubError};
pub use hub::{ClientInfo, Hub, HubHandle, HubStats};
