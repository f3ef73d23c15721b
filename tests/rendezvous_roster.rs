/// Rendezvous server behavior seen from bare sessions: roster hand-off,
/// join/leave broadcasts, teardown on disconnect and room relay.

#[cfg(test)]
mod tests {
    use imp_mesh::network::client::RendezvousClient;
    use imp_mesh::network::message::ServerMessage;
    use imp_mesh::network::roster::RosterHandle;
    use imp_mesh::{Envelope, Identity, MeshError, RendezvousServer};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start_server() -> (String, RosterHandle, CancellationToken) {
        let server = RendezvousServer::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let roster = server.roster();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));
        (addr, roster, token)
    }

    async fn register(
        server: &str,
        alias: &str,
    ) -> (
        RendezvousClient,
        imp_mesh::network::client::Registration,
        mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        RendezvousClient::register(server, &Identity::new(alias, ""), "127.0.0.1:1", WAIT)
            .await
            .unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out")
            .expect("session closed")
    }

    #[tokio::test]
    async fn test_roster_handoff_and_join_broadcast() {
        let (server, _roster, token) = start_server().await;

        let (_alice, alice_reg, mut alice_rx) = register(&server, "alice").await;
        assert!(alice_reg.roster.is_empty());

        let (_bob, bob_reg, _bob_rx) = register(&server, "bob").await;
        assert_eq!(bob_reg.roster.len(), 1);
        assert_eq!(bob_reg.roster[0].identity.id, "alice");
        assert_eq!(bob_reg.roster[0].address, alice_reg.address);

        match next(&mut alice_rx).await {
            ServerMessage::NodeJoined { entry } => {
                assert_eq!(entry.identity.id, "bob");
                assert_eq!(entry.address, bob_reg.address);
                assert_eq!(entry.endpoint, "127.0.0.1:1");
            }
            other => panic!("unexpected {:?}", other),
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_second_registrant_rejected() {
        let (server, roster, token) = start_server().await;
        let (_alice, alice_reg, _rx) = register(&server, "alice").await;

        let dup = RendezvousClient::register(&server, &Identity::new("ALICE", ""), "127.0.0.1:2", WAIT).await;
        assert!(matches!(dup, Err(MeshError::Registration(_))));

        let snapshot = roster.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address, alice_reg.address);
        token.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_removes_entry_and_broadcasts_leave() {
        let (server, roster, token) = start_server().await;
        let (_alice, _, mut alice_rx) = register(&server, "alice").await;
        let (bob, bob_reg, _bob_rx) = register(&server, "bob").await;
        assert!(matches!(next(&mut alice_rx).await, ServerMessage::NodeJoined { .. }));

        bob.close();
        match next(&mut alice_rx).await {
            ServerMessage::NodeLeft { address, id } => {
                assert_eq!(address, bob_reg.address);
                assert_eq!(id, "bob");
            }
            other => panic!("unexpected {:?}", other),
        }

        let snapshot = roster.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].identity.id, "alice");

        // The id is free again
        let (_bob_again, _, _) = register(&server, "bob").await;
        token.cancel();
    }

    #[tokio::test]
    async fn test_room_relay_reaches_members_only() {
        let (server, _roster, token) = start_server().await;
        let (alice, _, mut alice_rx) = register(&server, "alice").await;
        let (bob, _, mut bob_rx) = register(&server, "bob").await;
        let (_carol, _, mut carol_rx) = register(&server, "carol").await;
        // Presence traffic
        while !matches!(next(&mut alice_rx).await, ServerMessage::NodeJoined { entry } if entry.identity.id == "carol") {}
        assert!(matches!(next(&mut bob_rx).await, ServerMessage::NodeJoined { .. }));

        alice.join_room("grp-1").unwrap();
        bob.join_room("grp-1").unwrap();
        // Round-trip so both joins are applied before relaying
        bob.ping(1).unwrap();
        assert_eq!(next(&mut bob_rx).await, ServerMessage::Pong { nonce: 1 });
        alice.ping(2).unwrap();
        assert_eq!(next(&mut alice_rx).await, ServerMessage::Pong { nonce: 2 });

        let env = Envelope::group("alice", "grp-1", "hi room".to_string());
        alice.relay(env.clone()).unwrap();

        match next(&mut bob_rx).await {
            ServerMessage::Relayed { envelope, .. } => assert_eq!(envelope, env),
            other => panic!("unexpected {:?}", other),
        }

        // carol is not in the room and alice does not get her own message back
        alice.ping(3).unwrap();
        assert_eq!(next(&mut alice_rx).await, ServerMessage::Pong { nonce: 3 });
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(msg) = carol_rx.try_recv() {
            assert!(!matches!(msg, ServerMessage::Relayed { .. }));
        }
        token.cancel();
    }

    #[tokio::test]
    async fn test_left_room_gets_no_relay() {
        let (server, _roster, token) = start_server().await;
        let (alice, _, mut alice_rx) = register(&server, "alice").await;
        let (bob, _, mut bob_rx) = register(&server, "bob").await;
        assert!(matches!(next(&mut alice_rx).await, ServerMessage::NodeJoined { .. }));

        alice.join_room("grp-1").unwrap();
        bob.join_room("grp-1").unwrap();
        bob.leave_room("grp-1").unwrap();
        bob.ping(1).unwrap();
        assert_eq!(next(&mut bob_rx).await, ServerMessage::Pong { nonce: 1 });
        alice.ping(2).unwrap();
        assert_eq!(next(&mut alice_rx).await, ServerMessage::Pong { nonce: 2 });

        alice.relay(Envelope::group("alice", "grp-1", "anyone?".to_string())).unwrap();
        alice.ping(3).unwrap();
        assert_eq!(next(&mut alice_rx).await, ServerMessage::Pong { nonce: 3 });

        bob.ping(4).unwrap();
        assert_eq!(next(&mut bob_rx).await, ServerMessage::Pong { nonce: 4 });
        token.cancel();
    }
}
