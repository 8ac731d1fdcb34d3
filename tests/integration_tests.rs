//! Integration tests for the connection hub
//!
//! These tests drive a running hub through its public handle, using the
//! in-memory transport for routing and lifecycle behavior and real WebSocket
//! connections on localhost for the production transport.

use server::connection::memory::{MemoryConnection, MemoryFactory, MemoryPeer};
use server::{Hub, HubConfig, HubError, HubHandle};
use shared::{ClientId, ClientPacket, ServerPacket};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

/// Starts a hub over an empty data directory.
fn start_hub(outbox_capacity: usize) -> (HubHandle, tokio::task::JoinHandle<()>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let hub = Hub::new(dir.path(), HubConfig::new(outbox_capacity));
    let handle = hub.handle();
    let running = tokio::spawn(hub.run());
    (handle, running, dir)
}

/// Registers a memory client and consumes its welcome packet.
async fn join(handle: &HubHandle, identity: Option<&str>) -> (ClientId, MemoryPeer) {
    let (connection, mut peer) = MemoryConnection::pair(16);
    let connection = match identity {
        Some(identity) => connection.with_identity(identity),
        None => connection,
    };
    let client_id = handle.serve(&MemoryFactory, connection).await.unwrap();

    let welcome = timeout(WAIT, peer.recv()).await.expect("welcome packet");
    assert_eq!(welcome, Some(ServerPacket::Connected { client_id }));
    (client_id, peer)
}

async fn expect_message(peer: &mut MemoryPeer) -> (ClientId, Vec<u8>) {
    match timeout(WAIT, peer.recv()).await.expect("message within timeout") {
        Some(ServerPacket::Message { sender, payload }) => (sender, payload),
        other => panic!("expected a message, got {:?}", other),
    }
}

/// Gives in-flight deliveries a moment, then checks nothing arrived.
async fn expect_silence(peer: &mut MemoryPeer) {
    sleep(Duration::from_millis(50)).await;
    assert_eq!(peer.try_recv(), None);
}

async fn wait_until_gone(handle: &HubHandle, client_id: ClientId) {
    timeout(WAIT, async {
        loop {
            let stats = handle.snapshot().await.unwrap();
            if !stats.client_ids().contains(&client_id) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client should be unregistered");
}

/// ROUTING TESTS
mod routing_tests {
    use super::*;

    /// A broadcasts M1 to B and C, B leaves, M2 then reaches only C
    #[tokio::test]
    async fn broadcast_follows_membership() {
        let (handle, _running, _dir) = start_hub(16);
        let (a, mut peer_a) = join(&handle, None).await;
        let (b, mut peer_b) = join(&handle, None).await;
        let (_c, mut peer_c) = join(&handle, None).await;

        assert_ok!(peer_a.send(ClientPacket::broadcast(b"M1".to_vec())));
        assert_eq!(expect_message(&mut peer_b).await, (a, b"M1".to_vec()));
        assert_eq!(expect_message(&mut peer_c).await, (a, b"M1".to_vec()));
        expect_silence(&mut peer_a).await;

        peer_b.disconnect();
        wait_until_gone(&handle, b).await;

        assert_ok!(peer_a.send(ClientPacket::broadcast(b"M2".to_vec())));
        assert_eq!(expect_message(&mut peer_c).await, (a, b"M2".to_vec()));

        sleep(Duration::from_millis(50)).await;
        while let Some(packet) = peer_b.try_recv() {
            assert_ne!(
                packet,
                ServerPacket::Message {
                    sender: a,
                    payload: b"M2".to_vec()
                }
            );
        }
        expect_silence(&mut peer_a).await;
    }

    /// One broadcast among four clients reaches exactly the other three
    #[tokio::test]
    async fn broadcast_reaches_every_other_client_once() {
        let (handle, _running, _dir) = start_hub(16);
        let (sender, mut sender_peer) = join(&handle, None).await;
        let mut others = Vec::new();
        for _ in 0..3 {
            others.push(join(&handle, None).await);
        }

        assert_ok!(sender_peer.send(ClientPacket::broadcast(b"hello".to_vec())));

        for (_, peer) in others.iter_mut() {
            assert_eq!(expect_message(peer).await, (sender, b"hello".to_vec()));
            expect_silence(peer).await;
        }
        expect_silence(&mut sender_peer).await;
    }

    /// include_self echoes the broadcast back to the sender
    #[tokio::test]
    async fn broadcast_can_include_sender() {
        let (handle, _running, _dir) = start_hub(16);
        let (sender, mut sender_peer) = join(&handle, None).await;
        let (_other, mut other_peer) = join(&handle, None).await;

        assert_ok!(sender_peer.send(ClientPacket::broadcast_all(b"echo".to_vec())));

        assert_eq!(expect_message(&mut sender_peer).await, (sender, b"echo".to_vec()));
        assert_eq!(expect_message(&mut other_peer).await, (sender, b"echo".to_vec()));
    }

    /// Targeted packets reach their target only, unknown targets reach nobody
    #[tokio::test]
    async fn targeted_delivery() {
        let (handle, _running, _dir) = start_hub(16);
        let (a, mut peer_a) = join(&handle, None).await;
        let (b, mut peer_b) = join(&handle, None).await;
        let (_c, mut peer_c) = join(&handle, None).await;

        assert_ok!(peer_a.send(ClientPacket::to_client(b, b"psst".to_vec())));
        assert_eq!(expect_message(&mut peer_b).await, (a, b"psst".to_vec()));
        expect_silence(&mut peer_c).await;

        assert_ok!(peer_a.send(ClientPacket::to_client(4242, b"lost".to_vec())));
        expect_silence(&mut peer_a).await;
        expect_silence(&mut peer_b).await;
        expect_silence(&mut peer_c).await;

        // The sender is still registered after the dropped packet
        let stats = handle.snapshot().await.unwrap();
        assert!(stats.client_ids().contains(&a));
    }

    /// Packets from one sender arrive in the order they were sent
    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let (handle, _running, _dir) = start_hub(256);
        let (a, peer_a) = join(&handle, None).await;
        let (b, mut peer_b) = join(&handle, None).await;

        for i in 0u32..100 {
            assert_ok!(peer_a.send(ClientPacket::to_client(b, i.to_be_bytes().to_vec())));
        }

        for i in 0u32..100 {
            let (sender, payload) = expect_message(&mut peer_b).await;
            assert_eq!(sender, a);
            assert_eq!(payload, i.to_be_bytes().to_vec());
        }
    }

    /// Empty payloads are routed like any other
    #[tokio::test]
    async fn empty_payload_is_delivered() {
        let (handle, _running, _dir) = start_hub(16);
        let (a, peer_a) = join(&handle, None).await;
        let (_b, mut peer_b) = join(&handle, None).await;

        assert_ok!(peer_a.send(ClientPacket::broadcast(Vec::new())));
        assert_eq!(expect_message(&mut peer_b).await, (a, Vec::new()));
    }
}

/// LIFECYCLE TESTS
mod lifecycle_tests {
    use super::*;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use server::{Connection, ConnectionFactory, Upgraded};
    use std::collections::{BTreeSet, HashMap};

    /// The live set always equals registrations minus unregistrations
    #[tokio::test]
    async fn membership_tracks_register_and_unregister() {
        let (handle, _running, _dir) = start_hub(16);
        let mut joined = Vec::new();
        for _ in 0..5 {
            joined.push(join(&handle, None).await);
        }
        let ids: Vec<ClientId> = joined.iter().map(|(id, _)| *id).collect();

        assert_ok!(handle.unregister(ids[0]));
        assert_ok!(handle.unregister(ids[3]));
        joined[1].1.disconnect();
        wait_until_gone(&handle, ids[1]).await;

        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.client_ids(), vec![ids[2], ids[4]]);

        // Closed connections are released by the hub
        timeout(WAIT, joined[0].1.closed()).await.expect("closed");
        timeout(WAIT, joined[3].1.closed()).await.expect("closed");
    }

    /// Random interleavings of joins, evictions, unregisters and disconnects
    /// leave the hub holding exactly the clients a simple model expects
    #[tokio::test]
    async fn membership_matches_model_under_random_operations() {
        const IDENTITIES: [&str; 3] = ["red", "green", "blue"];

        for seed in [7u64, 42, 2024] {
            let (handle, _running, _dir) = start_hub(16);
            let mut rng = StdRng::seed_from_u64(seed);

            let mut live: BTreeSet<ClientId> = BTreeSet::new();
            let mut identities: HashMap<ClientId, &str> = HashMap::new();
            let mut peers: HashMap<ClientId, MemoryPeer> = HashMap::new();
            let mut gone: Vec<ClientId> = Vec::new();

            for step in 0..150 {
                match rng.gen_range(0..5) {
                    // Join, sometimes under an identity that may already be taken
                    0 | 1 => {
                        let identity = if rng.gen_bool(0.5) {
                            Some(IDENTITIES[rng.gen_range(0..IDENTITIES.len())])
                        } else {
                            None
                        };
                        let (client_id, peer) = join(&handle, identity).await;

                        if let Some(identity) = identity {
                            let replaced: Vec<ClientId> = identities
                                .iter()
                                .filter(|(_, taken)| **taken == identity)
                                .map(|(id, _)| *id)
                                .collect();
                            for id in replaced {
                                live.remove(&id);
                                identities.remove(&id);
                                gone.push(id);
                            }
                            identities.insert(client_id, identity);
                        }
                        live.insert(client_id);
                        peers.insert(client_id, peer);
                    }
                    // Unregister through the handle
                    2 if !live.is_empty() => {
                        let client_id = pick(&mut rng, &live);
                        assert_ok!(handle.unregister(client_id));
                        live.remove(&client_id);
                        identities.remove(&client_id);
                        gone.push(client_id);
                    }
                    // Remote side disconnects
                    3 if !live.is_empty() => {
                        let client_id = pick(&mut rng, &live);
                        if let Some(peer) = peers.get_mut(&client_id) {
                            peer.disconnect();
                        }
                        wait_until_gone(&handle, client_id).await;
                        live.remove(&client_id);
                        identities.remove(&client_id);
                        gone.push(client_id);
                    }
                    // Repeated unregister of a departed client, or an unknown id
                    _ => {
                        let client_id = if gone.is_empty() || rng.gen_bool(0.3) {
                            rng.gen_range(10_000..20_000)
                        } else {
                            gone[rng.gen_range(0..gone.len())]
                        };
                        assert_ok!(handle.unregister(client_id));
                    }
                }

                let stats = handle.snapshot().await.unwrap();
                let expected: Vec<ClientId> = live.iter().copied().collect();
                assert_eq!(
                    stats.client_ids(),
                    expected,
                    "seed {} diverged at step {}",
                    seed,
                    step
                );
            }

            assert_ok!(handle.shutdown());
        }
    }

    fn pick(rng: &mut StdRng, live: &BTreeSet<ClientId>) -> ClientId {
        let index = rng.gen_range(0..live.len());
        *live.iter().nth(index).unwrap()
    }

    /// A failed write tears the client down while its reads are still open
    #[tokio::test]
    async fn failed_write_unregisters_client() {
        let (handle, _running, _dir) = start_hub(16);
        let (sender, sender_peer) = join(&handle, None).await;
        let (broken, mut broken_peer) = join(&handle, None).await;

        broken_peer.fail_writes();
        assert_ok!(sender_peer.send(ClientPacket::to_client(broken, b"ping".to_vec())));

        wait_until_gone(&handle, broken).await;
        timeout(WAIT, broken_peer.closed()).await.expect("connection closed");

        // The reader side was still healthy, yet it is gone too
        assert_err!(broken_peer.send(ClientPacket::broadcast(b"late".to_vec())));
        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.client_ids(), vec![sender]);
    }

    /// Repeated and unknown unregisters are no-ops
    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (handle, _running, _dir) = start_hub(16);
        let (a, _peer_a) = join(&handle, None).await;
        let (b, _peer_b) = join(&handle, None).await;

        for _ in 0..3 {
            assert_ok!(handle.unregister(a));
        }
        assert_ok!(handle.unregister(31337));

        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.client_ids(), vec![b]);
    }

    /// Reconnecting with the same identity replaces the old connection
    #[tokio::test]
    async fn duplicate_identity_evicts_previous_client() {
        let (handle, _running, _dir) = start_hub(16);
        let (old_id, mut old_peer) = join(&handle, Some("player-7")).await;
        let (new_id, _new_peer) = join(&handle, Some("player-7")).await;
        let (_other, _other_peer) = join(&handle, Some("player-8")).await;

        assert_ne!(old_id, new_id);

        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.find_identity("player-7"), vec![new_id]);
        assert_eq!(stats.clients.len(), 2);

        timeout(WAIT, old_peer.closed()).await.expect("old connection closed");

        // The notice is best effort, but with an idle peer it gets through
        if let Some(packet) = old_peer.try_recv() {
            assert!(matches!(packet, ServerPacket::Disconnected { .. }));
        }
    }

    /// A client that never reads loses its own packets, nobody else does
    #[tokio::test]
    async fn slow_client_does_not_stall_others() {
        let (handle, _running, _dir) = start_hub(2);

        let (sender, sender_peer) = join(&handle, None).await;
        let (_fast, mut fast_peer) = join(&handle, None).await;

        // Never read from: its transport fills after one packet
        let (slow_connection, slow_peer) = MemoryConnection::pair(1);
        let slow = handle.serve(&MemoryFactory, slow_connection).await.unwrap();

        for i in 0u8..20 {
            assert_ok!(sender_peer.send(ClientPacket::broadcast(vec![i])));
            assert_eq!(expect_message(&mut fast_peer).await, (sender, vec![i]));
        }

        let stats = handle.snapshot().await.unwrap();
        assert!(stats.dropped_messages > 0);
        assert!(stats.client_ids().contains(&slow));
        assert!(!slow_peer.is_closed());
    }

    struct RefusingFactory;

    #[async_trait]
    impl ConnectionFactory<()> for RefusingFactory {
        async fn upgrade(&self, _request: ()) -> Result<Upgraded, HubError> {
            Err(HubError::TransportUpgradeFailed("handshake refused".to_string()))
        }
    }

    /// A failed upgrade registers nothing
    #[tokio::test]
    async fn failed_upgrade_is_not_registered() {
        let (handle, _running, _dir) = start_hub(16);

        let result = handle.serve(&RefusingFactory, ()).await;
        assert!(matches!(result, Err(HubError::TransportUpgradeFailed(_))));

        let (connection, _peer) = MemoryConnection::pair(1);
        connection.close().await;
        assert_err!(handle.serve(&MemoryFactory, connection).await);

        let stats = handle.snapshot().await.unwrap();
        assert!(stats.clients.is_empty());
    }

    /// Shutdown closes every connection and refuses new ones
    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (handle, running, _dir) = start_hub(16);
        let (_a, peer_a) = join(&handle, None).await;
        let (_b, peer_b) = join(&handle, Some("bob")).await;

        assert_ok!(handle.shutdown());
        timeout(WAIT, running).await.expect("hub stops").unwrap();

        assert!(peer_a.is_closed());
        assert!(peer_b.is_closed());

        let (late, late_peer) = MemoryConnection::pair(1);
        let result = handle.serve(&MemoryFactory, late).await;
        assert!(matches!(result, Err(HubError::Stopped)));
        assert!(late_peer.is_closed());
    }

    /// Game data loaded at startup is shared with every handle
    #[tokio::test]
    async fn game_data_is_available_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("maps.json"), r#"{"arena": {"size": 64}}"#).unwrap();

        let hub = Hub::new(dir.path(), HubConfig::default());
        let handle = hub.handle();
        tokio::spawn(hub.run());

        let data = handle.game_data();
        assert_eq!(data.names(), vec!["maps"]);
        assert_eq!(data.get("maps").unwrap()["arena"]["size"], 64);
    }
}

/// WEBSOCKET TRANSPORT TESTS
mod websocket_tests {
    use super::*;
    use client::HubClient;
    use server::connection::websocket::WebSocketFactory;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Serves the hub on an ephemeral localhost port.
    async fn start_server() -> (HubHandle, SocketAddr, tempfile::TempDir) {
        let (handle, _running, dir) = start_hub(64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let factory = Arc::new(WebSocketFactory::default());

        let accept_handle = handle.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handle = accept_handle.clone();
                let factory = Arc::clone(&factory);
                tokio::spawn(async move {
                    let _ = handle.serve(factory.as_ref(), stream).await;
                });
            }
        });

        (handle, address, dir)
    }

    /// Two WebSocket clients exchange broadcast and targeted packets
    #[tokio::test]
    async fn websocket_clients_exchange_packets() {
        let (handle, address, _dir) = start_server().await;
        let address = address.to_string();

        let mut alice = HubClient::connect(&address, Some("alice")).await.unwrap();
        let alice_id = timeout(WAIT, alice.wait_connected()).await.unwrap().unwrap();
        let mut bob = HubClient::connect(&address, None).await.unwrap();
        let bob_id = timeout(WAIT, bob.wait_connected()).await.unwrap().unwrap();

        assert_ne!(alice_id, bob_id);
        assert_eq!(alice.client_id(), Some(alice_id));

        alice
            .send(&ClientPacket::broadcast(b"hi bob".to_vec()))
            .await
            .unwrap();
        let packet = timeout(WAIT, bob.recv()).await.unwrap().unwrap();
        assert_eq!(
            packet,
            ServerPacket::Message {
                sender: alice_id,
                payload: b"hi bob".to_vec()
            }
        );

        bob.send(&ClientPacket::to_client(alice_id, b"hi alice".to_vec()))
            .await
            .unwrap();
        let packet = timeout(WAIT, alice.recv()).await.unwrap().unwrap();
        assert_eq!(
            packet,
            ServerPacket::Message {
                sender: bob_id,
                payload: b"hi alice".to_vec()
            }
        );

        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.find_identity("alice"), vec![alice_id]);

        bob.close().await.unwrap();
        wait_until_gone(&handle, bob_id).await;
    }

    /// Only the configured path is upgraded
    #[tokio::test]
    async fn websocket_rejects_other_paths() {
        let (handle, address, _dir) = start_server().await;

        let result = HubClient::connect_url(&format!("ws://{}/not-the-hub", address)).await;
        assert!(result.is_err());

        let stats = handle.snapshot().await.unwrap();
        assert!(stats.clients.is_empty());
    }

    /// A reconnect with the same identity tells the old socket why it was dropped
    #[tokio::test]
    async fn websocket_duplicate_identity_gets_notice() {
        let (_handle, address, _dir) = start_server().await;
        let address = address.to_string();

        let mut first = HubClient::connect(&address, Some("carol")).await.unwrap();
        timeout(WAIT, first.wait_connected()).await.unwrap().unwrap();

        let mut second = HubClient::connect(&address, Some("carol")).await.unwrap();
        timeout(WAIT, second.wait_connected()).await.unwrap().unwrap();

        match timeout(WAIT, first.recv()).await.unwrap() {
            Ok(ServerPacket::Disconnected { reason }) => assert!(!reason.is_empty()),
            other => panic!("expected a disconnect notice, got {:?}", other),
        }
        assert_eq!(first.client_id(), None);
        assert!(timeout(WAIT, first.recv()).await.unwrap().is_err());
    }

    /// Identities with reserved URL characters arrive intact and stay distinct
    #[tokio::test]
    async fn websocket_identity_survives_reserved_characters() {
        let (handle, address, _dir) = start_server().await;
        let address = address.to_string();

        let identities = ["p", "p&q", "john smith", "100%", "a=b+c"];
        let mut clients = Vec::new();
        for identity in identities {
            let mut client = HubClient::connect(&address, Some(identity)).await.unwrap();
            let client_id = timeout(WAIT, client.wait_connected()).await.unwrap().unwrap();
            clients.push((identity, client_id, client));
        }

        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.clients.len(), identities.len());
        for (identity, client_id, _) in &clients {
            assert_eq!(stats.find_identity(identity), vec![*client_id]);
        }
    }
}

/// Synchronous callers can still drive the hub through a runtime of their own
#[test]
fn hub_runs_on_a_blocking_caller() {
    tokio_test::block_on(async {
        let (handle, running, _dir) = start_hub(4);
        let (client_id, _peer) = join(&handle, Some("sync")).await;

        let stats = handle.snapshot().await.unwrap();
        assert_eq!(stats.find_identity("sync"), vec![client_id]);

        handle.shutdown().unwrap();
        running.await.unwrap();
    });
}
