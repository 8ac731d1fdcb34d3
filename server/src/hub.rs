//! The connection hub: single owner of every live client.
//!
//! All membership changes and all routing go through one coordination loop
//! ([`Hub::run`]). Other tasks reach it only by sending a [`HubEvent`] through
//! a [`HubHandle`], so the client map needs no lock: it is never touched
//! outside the loop.

use crate::client::{Client, ClientState, Delivery};
use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionFactory, Upgraded};
use crate::data::GameData;
use crate::dispatch;
use crate::error::HubError;
use futures::future::join_all;
use log::{debug, error, info};
use shared::{ClientId, ClientPacket, ServerPacket};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Reason sent to a client replaced by a newer connection with its identity.
const REPLACED_REASON: &str = "Connected from another location";

/// How long an evicted client's writer may take to flush its notice before
/// the connection is closed anyway.
const EVICTION_GRACE: Duration = Duration::from_secs(1);

/// Events consumed by the coordination loop.
pub(crate) enum HubEvent {
    Register {
        upgraded: Upgraded,
        reply: oneshot::Sender<Result<ClientId, HubError>>,
    },
    Unregister(ClientId),
    Inbound {
        sender: ClientId,
        packet: ClientPacket,
    },
    Snapshot(oneshot::Sender<HubStats>),
    Shutdown,
}

/// A live client as seen in a [`HubStats`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub identity: Option<String>,
    pub state: ClientState,
}

/// Point-in-time view of the hub.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub clients: Vec<ClientInfo>,
    /// Packets dropped because a recipient's outbox was full.
    pub dropped_messages: u64,
}

impl HubStats {
    /// Ids of all live clients, ascending.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.iter().map(|client| client.id).collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of the live clients registered under `identity`. Holds at most one
    /// id while identities are unique.
    pub fn find_identity(&self, identity: &str) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|client| client.identity.as_deref() == Some(identity))
            .map(|client| client.id)
            .collect()
    }
}

/// Owner of every live client and the coordination loop that drives them.
///
/// Build it with [`Hub::new`], take as many [`HubHandle`]s as needed, then
/// move it into a task with [`Hub::run`].
pub struct Hub {
    clients: HashMap<ClientId, Client>,
    /// `None` once every id has been handed out.
    next_client_id: Option<ClientId>,
    config: HubConfig,
    data: Arc<GameData>,
    dropped_messages: u64,
    /// Connection closes still in flight for clients already removed.
    closing: JoinSet<()>,
    events_tx: mpsc::UnboundedSender<HubEvent>,
    events_rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Hub {
    /// Creates a hub and loads game data from `data_dir`.
    ///
    /// A missing or unreadable data directory is logged and the hub starts
    /// with no data.
    pub fn new(data_dir: impl AsRef<Path>, config: HubConfig) -> Self {
        let data_dir = data_dir.as_ref();
        let data = match GameData::load(data_dir) {
            Ok(data) => {
                info!(
                    "Loaded {} game data document(s) from {}",
                    data.len(),
                    data_dir.display()
                );
                data
            }
            Err(e) => {
                error!("Failed to load game data, continuing without it: {}", e);
                GameData::default()
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            clients: HashMap::new(),
            next_client_id: Some(1),
            config,
            data: Arc::new(data),
            dropped_messages: 0,
            closing: JoinSet::new(),
            events_tx,
            events_rx,
        }
    }

    /// Returns a new handle to this hub. Handles stay valid after the hub has
    /// been moved into [`Hub::run`].
    pub fn handle(&self) -> HubHandle {
        HubHandle {
            events: self.events_tx.clone(),
            data: Arc::clone(&self.data),
        }
    }

    /// Runs the coordination loop until [`HubHandle::shutdown`] is called,
    /// then closes every remaining connection.
    pub async fn run(mut self) {
        info!(
            "Hub started (outbox capacity {})",
            self.config.outbox_capacity
        );

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        HubEvent::Register { upgraded, reply } => self.register(upgraded, reply),
                        HubEvent::Unregister(client_id) => self.unregister(client_id),
                        HubEvent::Inbound { sender, packet } => self.route(sender, packet),
                        HubEvent::Snapshot(reply) => {
                            let _ = reply.send(self.stats());
                        }
                        HubEvent::Shutdown => {
                            info!("Hub shutting down");
                            break;
                        }
                    }
                }
                Some(result) = self.closing.join_next(), if !self.closing.is_empty() => {
                    if let Err(e) = result {
                        error!("Connection close task failed: {}", e);
                    }
                }
            }
        }

        self.drain().await;
        info!("Hub stopped");
    }

    fn register(
        &mut self,
        upgraded: Upgraded,
        reply: oneshot::Sender<Result<ClientId, HubError>>,
    ) {
        let Some(client_id) = self.next_client_id else {
            error!("Client ids exhausted, refusing connection");
            let connection = upgraded.connection;
            self.closing.spawn(async move { connection.close().await });
            let _ = reply.send(Err(HubError::IdsExhausted));
            return;
        };
        self.next_client_id = client_id.checked_add(1);

        // Last connection wins: an identity maps to at most one live client
        if let Some(identity) = upgraded.identity.as_deref() {
            let replaced: Vec<ClientId> = self
                .clients
                .values()
                .filter(|client| client.identity() == Some(identity))
                .map(|client| client.id())
                .collect();

            for replaced_id in replaced {
                info!(
                    "Identity '{}' reconnected, evicting client {}",
                    identity, replaced_id
                );
                self.evict(replaced_id, REPLACED_REASON);
            }
        }

        let (mut client, outbox) = Client::new(client_id, upgraded, self.config.outbox_capacity);
        client.start(outbox, self.events_tx.clone());
        client.enqueue(Arc::new(ServerPacket::Connected { client_id }));

        match client.identity() {
            Some(identity) => info!("Client {} connected as '{}'", client_id, identity),
            None => info!("Client {} connected", client_id),
        }
        self.clients.insert(client_id, client);

        if reply.send(Ok(client_id)).is_err() {
            debug!("Caller stopped waiting for registration of client {}", client_id);
        }
    }

    /// Removes a client and tears it down. Unknown ids are ignored: both pumps
    /// may report the same failure.
    fn unregister(&mut self, client_id: ClientId) {
        let Some(connection) = self.remove(client_id) else {
            return;
        };
        // Closing may wait on the transport, never on the loop
        self.closing.spawn(async move { connection.close().await });
    }

    /// Takes a client out of the map and closes its outbox.
    fn remove(&mut self, client_id: ClientId) -> Option<Arc<dyn Connection>> {
        let Some(mut client) = self.clients.remove(&client_id) else {
            debug!("Unregister for unknown client {}", client_id);
            return None;
        };

        info!("Client {} disconnected", client_id);
        Some(client.begin_close())
    }

    /// Queues a notice for the client and removes it. Its writer delivers
    /// everything still queued, the notice last, then closes the connection;
    /// after [`EVICTION_GRACE`] the connection is closed regardless.
    fn evict(&mut self, client_id: ClientId, reason: &str) {
        if let Some(client) = self.clients.get(&client_id) {
            client.enqueue(Arc::new(ServerPacket::Disconnected {
                reason: reason.to_string(),
            }));
        }

        let Some(connection) = self.remove(client_id) else {
            return;
        };
        self.closing.spawn(async move {
            if tokio::time::timeout(EVICTION_GRACE, connection.closed())
                .await
                .is_err()
            {
                debug!("Evicted client {} did not drain in time", client_id);
            }
            connection.close().await;
        });
    }

    fn route(&mut self, sender: ClientId, packet: ClientPacket) {
        if !self.clients.contains_key(&sender) {
            debug!("Dropping packet from unregistered client {}", sender);
            return;
        }

        let recipients = dispatch::recipients(sender, packet.target, &self.clients);
        if recipients.is_empty() {
            debug!("No recipients for packet from client {}", sender);
            return;
        }

        let message = Arc::new(ServerPacket::Message {
            sender,
            payload: packet.payload,
        });

        for client_id in recipients {
            let Some(client) = self.clients.get(&client_id) else {
                continue;
            };
            match client.enqueue(Arc::clone(&message)) {
                Delivery::Queued => {}
                Delivery::Full => {
                    self.dropped_messages += 1;
                    debug!(
                        "Outbox of client {} full, dropped packet from {}",
                        client_id, sender
                    );
                }
                Delivery::Closed => {}
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            clients: self
                .clients
                .values()
                .map(|client| ClientInfo {
                    id: client.id(),
                    identity: client.identity().map(str::to_string),
                    state: client.state(),
                })
                .collect(),
            dropped_messages: self.dropped_messages,
        }
    }

    /// Unregisters everything still alive and waits for every connection to
    /// close: live ones, ones whose registration never got processed, and ones
    /// removed earlier whose close is still running.
    async fn drain(&mut self) {
        self.events_rx.close();

        let mut connections: Vec<Arc<dyn Connection>> = self
            .clients
            .drain()
            .map(|(_, mut client)| client.begin_close())
            .collect();

        while let Ok(event) = self.events_rx.try_recv() {
            if let HubEvent::Register { upgraded, reply } = event {
                let _ = reply.send(Err(HubError::Stopped));
                connections.push(upgraded.connection);
            }
        }

        if !connections.is_empty() {
            info!("Closing {} remaining connection(s)", connections.len());
        }
        join_all(connections.iter().map(|connection| connection.close())).await;

        while let Some(result) = self.closing.join_next().await {
            if let Err(e) = result {
                error!("Connection close task failed: {}", e);
            }
        }
    }
}

/// Cloneable entry point into a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    events: mpsc::UnboundedSender<HubEvent>,
    data: Arc<GameData>,
}

impl HubHandle {
    /// Upgrades `request` with `factory` and registers the resulting client.
    ///
    /// Returns the id assigned by the hub once registration went through. The
    /// connection itself keeps running on its own pumps.
    pub async fn serve<R, F>(&self, factory: &F, request: R) -> Result<ClientId, HubError>
    where
        R: Send + 'static,
        F: ConnectionFactory<R> + ?Sized,
    {
        let upgraded = factory.upgrade(request).await?;

        let (reply, registered) = oneshot::channel();
        if let Err(mpsc::error::SendError(event)) =
            self.events.send(HubEvent::Register { upgraded, reply })
        {
            if let HubEvent::Register { upgraded, .. } = event {
                upgraded.connection.close().await;
            }
            return Err(HubError::Stopped);
        }

        match registered.await {
            Ok(result) => result,
            Err(_) => Err(HubError::Stopped),
        }
    }

    /// Asks the hub to disconnect a client. Unknown ids are ignored.
    pub fn unregister(&self, client_id: ClientId) -> Result<(), HubError> {
        self.send(HubEvent::Unregister(client_id))
    }

    /// Current clients and counters, as seen by the coordination loop after
    /// every event sent through this handle before the call.
    pub async fn snapshot(&self) -> Result<HubStats, HubError> {
        let (reply, stats) = oneshot::channel();
        self.send(HubEvent::Snapshot(reply))?;
        stats.await.map_err(|_| HubError::Stopped)
    }

    /// Stops the coordination loop. [`Hub::run`] returns once every
    /// remaining connection is closed.
    pub fn shutdown(&self) -> Result<(), HubError> {
        self.send(HubEvent::Shutdown)
    }

    /// Game data loaded when the hub was built.
    pub fn game_data(&self) -> Arc<GameData> {
        Arc::clone(&self.data)
    }

    /// Whether the coordination loop has stopped accepting events.
    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }

    fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.events.send(event).map_err(|_| HubError::Stopped)
    }
}
