//! Rendezvous roster actor - a single task owns every roster entry and room
//! and applies commands one at a time, so registration, updates and teardown
//! never interleave for the same address.

use crate::error::MeshError;
use crate::network::message::ServerMessage;
use crate::types::{Address, Envelope, EnvelopeKind, Identity, RosterEntry};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Channel the actor pushes to; drained by the session task that owns the socket.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

const ADDRESS_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Commands sent to the roster actor
pub enum RosterCommand {
    Register {
        identity: Identity,
        endpoint: String,
        outbox: Outbox,
        resp: oneshot::Sender<Result<(Address, Vec<RosterEntry>), MeshError>>,
    },
    UpdateIdentity {
        address: Address,
        identity: Identity,
        resp: oneshot::Sender<Option<RosterEntry>>,
    },
    Relay {
        from: Address,
        envelope: Envelope,
        resp: oneshot::Sender<usize>,
    },
    JoinRoom {
        address: Address,
        room_id: String,
    },
    LeaveRoom {
        address: Address,
        room_id: String,
    },
    Touch {
        address: Address,
    },
    Disconnect {
        address: Address,
        resp: oneshot::Sender<bool>,
    },
    Snapshot {
        resp: oneshot::Sender<Vec<RosterEntry>>,
    },
}

struct Session {
    entry: RosterEntry,
    outbox: Outbox,
}

/// Roster state. Only the actor task touches it.
#[derive(Default)]
pub struct RosterState {
    sessions: HashMap<Address, Session>,
    by_id: HashMap<String, Address>,
    rooms: HashMap<String, HashSet<Address>>,
}

impl RosterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn register(
        &mut self,
        identity: Identity,
        endpoint: String,
        outbox: Outbox,
    ) -> Result<(Address, Vec<RosterEntry>), MeshError> {
        if identity.id.is_empty() {
            return Err(MeshError::Registration("identity id is empty".to_string()));
        }
        if Identity::normalize_id(&identity.id) != identity.id {
            return Err(MeshError::Registration(format!(
                "identity id '{}' is not normalized",
                identity.id
            )));
        }
        if let Some(existing) = self.by_id.get(&identity.id) {
            return Err(MeshError::Registration(format!(
                "identity '{}' already in use by {}",
                identity.id, existing
            )));
        }

        let address = self.assign_address(&identity.id);
        let entry = RosterEntry {
            identity,
            address: address.clone(),
            endpoint,
            last_seen: now_millis(),
        };

        let others: Vec<RosterEntry> = self.sessions.values().map(|s| s.entry.clone()).collect();
        self.broadcast_except(&address, ServerMessage::NodeJoined {
            entry: entry.clone(),
        });

        self.by_id.insert(entry.identity.id.clone(), address.clone());
        info!(
            "✅ Registered {} as {} ({} other node(s) online)",
            entry.identity.id,
            address,
            others.len()
        );
        self.sessions.insert(address.clone(), Session { entry, outbox });

        Ok((address, others))
    }

    pub fn update_identity(&mut self, address: &Address, identity: &Identity) -> Option<RosterEntry> {
        let session = self.sessions.get_mut(address)?;
        session.entry.identity.merge(identity);
        session.entry.last_seen = now_millis();
        let entry = session.entry.clone();

        debug!("🔄 Identity update for {} ({})", entry.identity.id, address);
        self.broadcast_except(address, ServerMessage::NodeUpdated {
            entry: entry.clone(),
        });
        Some(entry)
    }

    /// Forward an envelope on behalf of `from`. Returns how many sessions got it.
    /// Offline recipients are dropped silently.
    pub fn relay(&mut self, from: &Address, envelope: Envelope) -> usize {
        self.touch(from);
        match envelope.kind {
            EnvelopeKind::Direct => {
                let Some(recipient) = envelope.recipient_id.as_deref() else {
                    return 0;
                };
                let Some(target) = self.by_id.get(recipient).cloned() else {
                    debug!("📭 Relay drop: {} is offline", recipient);
                    return 0;
                };
                if &target == from {
                    return 0;
                }
                self.push(&target, ServerMessage::Relayed {
                    from: from.clone(),
                    envelope,
                }) as usize
            }
            EnvelopeKind::Group => {
                let Some(room_id) = envelope.group_id.as_deref() else {
                    return 0;
                };
                let targets: Vec<Address> = self
                    .rooms
                    .get(room_id)
                    .map(|members| members.iter().filter(|a| *a != from).cloned().collect())
                    .unwrap_or_default();

                let mut delivered = 0;
                for target in targets {
                    let msg = ServerMessage::Relayed {
                        from: from.clone(),
                        envelope: envelope.clone(),
                    };
                    if self.push(&target, msg) {
                        delivered += 1;
                    }
                }
                delivered
            }
        }
    }

    pub fn join_room(&mut self, address: &Address, room_id: &str) {
        if !self.sessions.contains_key(address) {
            return;
        }
        self.touch(address);
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(address.clone());
    }

    pub fn leave_room(&mut self, address: &Address, room_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(address);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    pub fn touch(&mut self, address: &Address) {
        if let Some(session) = self.sessions.get_mut(address) {
            session.entry.last_seen = now_millis();
        }
    }

    /// Tear down everything tied to `address` in one step.
    pub fn disconnect(&mut self, address: &Address) -> bool {
        let Some(session) = self.sessions.remove(address) else {
            return false;
        };
        let id = session.entry.identity.id;
        if self.by_id.get(&id) == Some(address) {
            self.by_id.remove(&id);
        }
        self.rooms.retain(|_, members| {
            members.remove(address);
            !members.is_empty()
        });

        info!("🔌 {} ({}) left the roster", id, address);
        self.broadcast_except(address, ServerMessage::NodeLeft {
            address: address.clone(),
            id,
        });
        true
    }

    pub fn snapshot(&self) -> Vec<RosterEntry> {
        self.sessions.values().map(|s| s.entry.clone()).collect()
    }

    pub fn room_members(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    fn assign_address(&self, id: &str) -> Address {
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (0..4)
                .map(|_| ADDRESS_ALPHABET[rng.gen_range(0..ADDRESS_ALPHABET.len())] as char)
                .collect();
            let address = Address::new(format!("imp-{}-{}", id, suffix));
            if !self.sessions.contains_key(&address) {
                return address;
            }
        }
    }

    fn push(&self, target: &Address, msg: ServerMessage) -> bool {
        match self.sessions.get(target) {
            Some(session) => {
                if session.outbox.send(msg).is_err() {
                    warn!("Outbox for {} is closed", target);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    fn broadcast_except(&self, skip: &Address, msg: ServerMessage) {
        for (address, session) in &self.sessions {
            if address == skip {
                continue;
            }
            if session.outbox.send(msg.clone()).is_err() {
                debug!("Skipping closed outbox for {}", address);
            }
        }
    }

    fn apply(&mut self, cmd: RosterCommand) {
        match cmd {
            RosterCommand::Register {
                identity,
                endpoint,
                outbox,
                resp,
            } => {
                let _ = resp.send(self.register(identity, endpoint, outbox));
            }
            RosterCommand::UpdateIdentity {
                address,
                identity,
                resp,
            } => {
                let _ = resp.send(self.update_identity(&address, &identity));
            }
            RosterCommand::Relay {
                from,
                envelope,
                resp,
            } => {
                let _ = resp.send(self.relay(&from, envelope));
            }
            RosterCommand::JoinRoom { address, room_id } => self.join_room(&address, &room_id),
            RosterCommand::LeaveRoom { address, room_id } => self.leave_room(&address, &room_id),
            RosterCommand::Touch { address } => self.touch(&address),
            RosterCommand::Disconnect { address, resp } => {
                let _ = resp.send(self.disconnect(&address));
            }
            RosterCommand::Snapshot { resp } => {
                let _ = resp.send(self.snapshot());
            }
        }
    }
}

/// Cloneable handle to the roster actor.
#[derive(Clone)]
pub struct RosterHandle {
    tx: mpsc::Sender<RosterCommand>,
}

impl RosterHandle {
    /// Spawn the actor. It stops once every handle is dropped.
    pub fn spawn(buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(buffer.max(1));
        let task = tokio::spawn(async move {
            let mut state = RosterState::new();
            while let Some(cmd) = rx.recv().await {
                state.apply(cmd);
            }
            debug!("Roster actor stopped ({} entries dropped)", state.len());
        });
        (Self { tx }, task)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RosterCommand,
    ) -> Result<T, MeshError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(build(resp))
            .await
            .map_err(|_| MeshError::Protocol("roster actor stopped".to_string()))?;
        rx.await
            .map_err(|_| MeshError::Protocol("roster actor dropped reply".to_string()))
    }

    pub async fn register(
        &self,
        identity: Identity,
        endpoint: String,
        outbox: Outbox,
    ) -> Result<(Address, Vec<RosterEntry>), MeshError> {
        self.request(|resp| RosterCommand::Register {
            identity,
            endpoint,
            outbox,
            resp,
        })
        .await?
    }

    pub async fn update_identity(
        &self,
        address: Address,
        identity: Identity,
    ) -> Result<Option<RosterEntry>, MeshError> {
        self.request(|resp| RosterCommand::UpdateIdentity {
            address,
            identity,
            resp,
        })
        .await
    }

    pub async fn relay(&self, from: Address, envelope: Envelope) -> Result<usize, MeshError> {
        self.request(|resp| RosterCommand::Relay {
            from,
            envelope,
            resp,
        })
        .await
    }

    pub async fn join_room(&self, address: Address, room_id: String) -> Result<(), MeshError> {
        self.send(RosterCommand::JoinRoom { address, room_id }).await
    }

    pub async fn leave_room(&self, address: Address, room_id: String) -> Result<(), MeshError> {
        self.send(RosterCommand::LeaveRoom { address, room_id }).await
    }

    pub async fn touch(&self, address: Address) -> Result<(), MeshError> {
        self.send(RosterCommand::Touch { address }).await
    }

    pub async fn disconnect(&self, address: Address) -> Result<bool, MeshError> {
        self.request(|resp| RosterCommand::Disconnect { address, resp })
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<RosterEntry>, MeshError> {
        self.request(|resp| RosterCommand::Snapshot { resp }).await
    }

    async fn send(&self, cmd: RosterCommand) -> Result<(), MeshError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| MeshError::Protocol("roster actor stopped".to_string()))
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    fn register(
        state: &mut RosterState,
        alias: &str,
    ) -> (Address, Vec<RosterEntry>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = outbox();
        let (address, roster) = state
            .register(Identity::new(alias, ""), "127.0.0.1:1".to_string(), tx)
            .unwrap();
        (address, roster, rx)
    }

    #[test]
    fn test_register_returns_other_entries() {
        let mut state = RosterState::new();
        let (alice, roster, mut alice_rx) = register(&mut state, "alice");
        assert!(roster.is_empty());
        assert!(alice.as_str().starts_with("imp-alice-"));

        let (bob, roster, mut bob_rx) = register(&mut state, "bob");
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].address, alice);

        match alice_rx.try_recv().unwrap() {
            ServerMessage::NodeJoined { entry } => assert_eq!(entry.address, bob),
            other => panic!("unexpected {:?}", other),
        }
        // The registrant is not told about itself
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let mut state = RosterState::new();
        let (first, _, _rx) = register(&mut state, "alice");

        let (tx, _rx2) = outbox();
        let result = state.register(Identity::new("Alice", ""), "127.0.0.1:2".to_string(), tx);
        assert!(matches!(result, Err(MeshError::Registration(_))));
        assert_eq!(state.len(), 1);
        assert_eq!(state.snapshot()[0].address, first);
    }

    #[test]
    fn test_unnormalized_id_rejected() {
        let mut state = RosterState::new();
        let (_alice, _, _rx) = register(&mut state, "alice");

        for raw in ["Alice", "alice smith", " bob"] {
            let (tx, _rx) = outbox();
            let identity = Identity {
                id: raw.to_string(),
                display_name: raw.to_string(),
                avatar_ref: String::new(),
                public_key: None,
            };
            let result = state.register(identity, "127.0.0.1:2".to_string(), tx);
            assert!(matches!(result, Err(MeshError::Registration(_))), "{} accepted", raw);
        }
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let mut state = RosterState::new();
        let (tx, _rx) = outbox();
        let result = state.register(Identity::new("   ", ""), "127.0.0.1:2".to_string(), tx);
        assert!(matches!(result, Err(MeshError::Registration(_))));
    }

    #[test]
    fn test_update_identity_broadcasts() {
        let mut state = RosterState::new();
        let (alice, _, _alice_rx) = register(&mut state, "alice");
        let (_bob, _, mut bob_rx) = register(&mut state, "bob");

        let mut patch = Identity::new("alice", "new.png");
        patch.public_key = Some("rotated".to_string());
        let updated = state.update_identity(&alice, &patch).unwrap();
        assert_eq!(updated.identity.public_key.as_deref(), Some("rotated"));

        match bob_rx.try_recv().unwrap() {
            ServerMessage::NodeUpdated { entry } => {
                assert_eq!(entry.identity.avatar_ref, "new.png");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_direct_relay_and_offline_drop() {
        let mut state = RosterState::new();
        let (_alice, _, mut alice_rx) = register(&mut state, "alice");
        let (bob, _, _bob_rx) = register(&mut state, "bob");
        let _ = alice_rx.try_recv(); // NodeJoined{bob}

        let env = Envelope::direct("bob", "alice", "hi".to_string(), false);
        assert_eq!(state.relay(&bob, env.clone()), 1);
        match alice_rx.try_recv().unwrap() {
            ServerMessage::Relayed { from, envelope } => {
                assert_eq!(from, bob);
                assert_eq!(envelope, env);
            }
            other => panic!("unexpected {:?}", other),
        }

        let offline = Envelope::direct("bob", "carol", "hi".to_string(), false);
        assert_eq!(state.relay(&bob, offline), 0);
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_group_relay_excludes_sender() {
        let mut state = RosterState::new();
        let (alice, _, mut alice_rx) = register(&mut state, "alice");
        let (bob, _, mut bob_rx) = register(&mut state, "bob");
        let (carol, _, mut carol_rx) = register(&mut state, "carol");
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        state.join_room(&alice, "grp-1");
        state.join_room(&bob, "grp-1");
        state.join_room(&carol, "grp-1");

        let env = Envelope::group("alice", "grp-1", "hello".to_string());
        assert_eq!(state.relay(&alice, env), 2);
        assert!(matches!(bob_rx.try_recv(), Ok(ServerMessage::Relayed { .. })));
        assert!(matches!(carol_rx.try_recv(), Ok(ServerMessage::Relayed { .. })));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_tears_down_everything() {
        let mut state = RosterState::new();
        let (alice, _, _alice_rx) = register(&mut state, "alice");
        let (bob, _, mut bob_rx) = register(&mut state, "bob");
        state.join_room(&alice, "grp-1");
        state.join_room(&bob, "grp-1");

        assert!(state.disconnect(&alice));
        assert!(!state.disconnect(&alice));
        assert_eq!(state.len(), 1);
        assert_eq!(state.room_members("grp-1"), 1);

        match bob_rx.try_recv().unwrap() {
            ServerMessage::NodeLeft { address, id } => {
                assert_eq!(address, alice);
                assert_eq!(id, "alice");
            }
            other => panic!("unexpected {:?}", other),
        }

        // The id is free again after teardown
        let (tx, _rx) = outbox();
        assert!(state
            .register(Identity::new("alice", ""), "127.0.0.1:3".to_string(), tx)
            .is_ok());
    }

    #[tokio::test]
    async fn test_actor_handle_serializes_commands() {
        let (roster, _task) = RosterHandle::spawn(16);
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        let (alice, _) = roster
            .register(Identity::new("alice", ""), "127.0.0.1:1".to_string(), tx1)
            .await
            .unwrap();
        let dup = roster
            .register(Identity::new("alice", ""), "127.0.0.1:2".to_string(), tx2)
            .await;
        assert!(matches!(dup, Err(MeshError::Registration(_))));

        assert_eq!(roster.snapshot().await.unwrap().len(), 1);
        assert!(roster.disconnect(alice).await.unwrap());
        assert!(roster.snapshot().await.unwrap().is_empty());
    }
}
