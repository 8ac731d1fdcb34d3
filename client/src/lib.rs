//! # Game Hub Client Library
//!
//! Client side of the game hub's real-time endpoint. A [`HubClient`] opens a
//! WebSocket to the server, waits for the welcome packet carrying its id, and
//! then exchanges [`shared::ClientPacket`]s and [`shared::ServerPacket`]s.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::HubClient;
//! use shared::{ClientPacket, ServerPacket};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut hub = HubClient::connect("127.0.0.1:8081", Some("player-one")).await?;
//!     let my_id = hub.wait_connected().await?;
//!
//!     hub.send(&ClientPacket::broadcast(b"hello".to_vec())).await?;
//!
//!     if let ServerPacket::Message { sender, payload } = hub.recv().await? {
//!         println!("{} -> {}: {} bytes", sender, my_id, payload.len());
//!     }
//!
//!     hub.close().await?;
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{endpoint_url, ClientError, HubClient};
