//! Mesh facade: the one entry point an application uses.
//!
//! `join` generates a session keypair, registers with the rendezvous server,
//! starts the peer listener and dials every node already online. Inbound
//! traffic from peer links and from the relay is filtered, de-duplicated,
//! decrypted and published as [`MeshEvent`]s on a broadcast channel.
//!
//! Direct messages go over the peer link when one is open and fall back to
//! the server relay otherwise. Group messages are broadcast over every open
//! link and also relayed through the group's room when some online member has
//! no link to us.

use crate::config::NodeConfig;
use crate::crypto::{KeyService, PrivateKey};
use crate::error::MeshError;
use crate::network::client::RendezvousClient;
use crate::network::connection_manager::ConnectionManager;
use crate::network::dedup_filter::DeduplicationFilter;
use crate::network::events::{EventKind, PeerEvent};
use crate::network::message::{PeerMessage, ServerMessage};
use crate::types::{Address, Envelope, EnvelopeKind, Group, Identity, RosterEntry};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Shown in place of a direct message that could not be decrypted.
pub const DECRYPTION_FAILED_MARKER: &str = "[Decryption Failed]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Written to an open peer link
    Direct,
    /// Handed to the rendezvous server
    Relayed,
    /// Neither path was available; the message may never arrive
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub envelope_id: String,
    pub route: Route,
    /// False when the recipient had no known public key and the payload went out in clear
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub kind: EnvelopeKind,
    pub sender_id: String,
    pub group_id: Option<String>,
    pub text: String,
    pub encrypted: bool,
    pub decryption_failed: bool,
    pub timestamp: i64,
    pub route: Route,
}

#[derive(Debug, Clone)]
pub enum MeshEvent {
    Message(ReceivedMessage),
    PeerJoined(RosterEntry),
    PeerUpdated(RosterEntry),
    PeerLeft { address: Address, id: String },
    PeerConnected { address: Address, id: String },
    PeerDisconnected { address: Address },
    GroupJoined(Group),
    DeliveryPending { envelope_id: String, recipient: String },
    /// The rendezvous session dropped; call `leave` then `join` again
    RendezvousLost,
}

/// State that only exists between `join` and `leave`.
struct Session {
    identity: RwLock<Identity>,
    address: Address,
    private_key: PrivateKey,
    manager: ConnectionManager,
    rendezvous: RendezvousClient,
    /// Identity id → latest roster entry
    roster: DashMap<String, RosterEntry>,
    groups: Arc<DashMap<String, Group>>,
    seen: Arc<DeduplicationFilter>,
    events: broadcast::Sender<MeshEvent>,
    closing: AtomicBool,
}

pub struct MeshNode {
    config: NodeConfig,
    session: RwLock<Option<Arc<Session>>>,
    groups: Arc<DashMap<String, Group>>,
    seen: Arc<DeduplicationFilter>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshNode {
    pub fn new(config: NodeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let seen = Arc::new(DeduplicationFilter::new(config.dedup_capacity));
        Self {
            config,
            session: RwLock::new(None),
            groups: Arc::new(DashMap::new()),
            seen,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn is_joined(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn address(&self) -> Option<Address> {
        self.session.read().as_ref().map(|s| s.address.clone())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.session.read().as_ref().map(|s| s.identity.read().clone())
    }

    /// Everyone else currently online, as last reported by the server.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = match self.session.read().as_ref() {
            Some(session) => session.roster.iter().map(|e| e.value().clone()).collect(),
            None => Vec::new(),
        };
        entries.sort_by(|a, b| a.identity.id.cmp(&b.identity.id));
        entries
    }

    pub fn open_connections(&self) -> Vec<Address> {
        match self.session.read().as_ref() {
            Some(session) => session.manager.open_connections(),
            None => Vec::new(),
        }
    }

    pub fn groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    fn session(&self) -> Result<Arc<Session>, MeshError> {
        self.session.read().clone().ok_or(MeshError::NotJoined)
    }

    /// Join the mesh as `identity` and return the address the server assigned.
    pub async fn join(&self, identity: Identity) -> Result<Address, MeshError> {
        if self.is_joined() {
            return Err(MeshError::Protocol("already joined".to_string()));
        }

        let mut identity = identity;
        identity.id = Identity::normalize_id(&identity.id);
        if identity.id.is_empty() {
            return Err(MeshError::Registration("identity id is empty".to_string()));
        }
        if identity.display_name.trim().is_empty() {
            identity.display_name = identity.id.clone();
        }

        // Fresh keys every session; peers pick them up from the roster
        let (public_key, private_key) = KeyService::generate_keypair();
        identity.public_key = Some(KeyService::export_public_key(&public_key));

        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let endpoint = match &self.config.advertise_address {
            Some(advertised) => advertised.clone(),
            None => listener.local_addr()?.to_string(),
        };

        let (rendezvous, registration, inbound) = RendezvousClient::register(
            &self.config.rendezvous_address,
            &identity,
            &endpoint,
            self.config.register_timeout(),
        )
        .await?;

        let manager = ConnectionManager::new(self.config.connect_timeout());
        let session = Arc::new(Session {
            identity: RwLock::new(identity.clone()),
            address: registration.address.clone(),
            private_key,
            manager: manager.clone(),
            rendezvous,
            roster: DashMap::new(),
            groups: self.groups.clone(),
            seen: self.seen.clone(),
            events: self.events.clone(),
            closing: AtomicBool::new(false),
        });

        for entry in &registration.roster {
            session.remember(entry.clone());
        }
        wire_handlers(&session);
        manager.start(listener, registration.address.clone(), identity.clone());

        for group in self.groups.iter() {
            if group.has_member(&identity.id) {
                let _ = session.rendezvous.join_room(&group.id);
            }
        }

        {
            let mut slot = self.session.write();
            if slot.is_some() {
                session.shutdown();
                return Err(MeshError::Protocol("already joined".to_string()));
            }
            *slot = Some(session.clone());
        }
        tokio::spawn(pump_rendezvous(session.clone(), inbound));

        info!(
            "✅ Joined mesh as {} ({}), {} peer(s) online",
            identity.id,
            registration.address,
            registration.roster.len()
        );

        // Dial everyone already online; failures only raise events
        let mut dials = JoinSet::new();
        for entry in registration.roster {
            let manager = manager.clone();
            dials.spawn(async move { manager.connect(&entry.address).await });
        }
        while let Some(result) = dials.join_next().await {
            if let Ok(Err(e)) = result {
                debug!("Initial dial failed: {}", e);
            }
        }

        Ok(registration.address)
    }

    /// Send a 1:1 message. Encrypted when the recipient's public key is known.
    pub async fn send_direct(&self, recipient_id: &str, plaintext: &str) -> Result<SendReceipt, MeshError> {
        let session = self.session()?;
        let recipient_id = Identity::normalize_id(recipient_id);
        let sender_id = session.local_id();
        let entry = session.roster.get(&recipient_id).map(|e| e.value().clone());

        let public_key = entry.as_ref().and_then(|e| e.identity.public_key.clone());
        let (payload, encrypted) = match public_key {
            Some(key) => {
                let key = KeyService::import_public_key(&key)?;
                (KeyService::encrypt(plaintext, &key)?, true)
            }
            None => {
                warn!("⚠️ No public key for {}, sending unencrypted", recipient_id);
                (plaintext.to_string(), false)
            }
        };

        let envelope = Envelope::direct(&sender_id, &recipient_id, payload, encrypted);
        session.seen.mark(&envelope.id);
        let envelope_id = envelope.id.clone();

        if let Some(entry) = &entry {
            match session.manager.send(&envelope, Some(&entry.address)) {
                Ok(_) => {
                    return Ok(SendReceipt {
                        envelope_id,
                        route: Route::Direct,
                        encrypted,
                    })
                }
                Err(MeshError::NoRoute(address)) => {
                    debug!("No link to {}, relaying", address);
                    // Try to have a link ready for the next message
                    let manager = session.manager.clone();
                    tokio::spawn(async move {
                        let _ = manager.connect(&address).await;
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let route = if entry.is_some() && session.rendezvous.relay(envelope).is_ok() {
            Route::Relayed
        } else {
            let _ = self.events.send(MeshEvent::DeliveryPending {
                envelope_id: envelope_id.clone(),
                recipient: recipient_id.clone(),
            });
            Route::Pending
        };
        Ok(SendReceipt {
            envelope_id,
            route,
            encrypted,
        })
    }

    /// Send a cleartext message to every member of a known group.
    pub async fn send_group(&self, group_id: &str, plaintext: &str) -> Result<SendReceipt, MeshError> {
        let session = self.session()?;
        let group = self
            .groups
            .get(group_id)
            .map(|g| g.value().clone())
            .ok_or_else(|| MeshError::UnknownGroup(group_id.to_string()))?;

        let sender_id = session.local_id();
        let envelope = Envelope::group(&sender_id, &group.id, plaintext.to_string());
        session.seen.mark(&envelope.id);
        let envelope_id = envelope.id.clone();

        let sent = session.manager.send(&envelope, None)?;
        let unreachable = group
            .members
            .iter()
            .filter(|id| **id != sender_id)
            .filter_map(|id| session.roster.get(id).map(|e| e.address.clone()))
            .filter(|address| !session.manager.is_open(address))
            .count();

        let relayed = (sent == 0 || unreachable > 0) && session.rendezvous.relay(envelope).is_ok();
        let route = match (sent, relayed) {
            (_, true) => Route::Relayed,
            (n, false) if n > 0 => Route::Direct,
            _ => {
                let _ = self.events.send(MeshEvent::DeliveryPending {
                    envelope_id: envelope_id.clone(),
                    recipient: group.id.clone(),
                });
                Route::Pending
            }
        };
        debug!(
            "📡 Group {} message {} to {} link(s), relayed: {}",
            group.id, envelope_id, sent, relayed
        );

        Ok(SendReceipt {
            envelope_id,
            route,
            encrypted: false,
        })
    }

    /// Create a group with `members` (the local id is always added) and
    /// announce it to every member we have a link to.
    pub async fn create_group(
        &self,
        name: &str,
        members: impl IntoIterator<Item = String>,
    ) -> Result<Group, MeshError> {
        let session = self.session()?;
        let local_id = session.local_id();
        let mut member_ids: Vec<String> = members
            .into_iter()
            .map(|m| Identity::normalize_id(&m))
            .filter(|m| !m.is_empty())
            .collect();
        member_ids.push(local_id);

        let group = Group::new(name.trim(), member_ids);
        self.groups.insert(group.id.clone(), group.clone());
        session.rendezvous.join_room(&group.id)?;
        let announced = session.announce_group(&group);
        info!(
            "👥 Created group {} ({}) with {} member(s), announced to {}",
            group.name,
            group.id,
            group.members.len(),
            announced
        );
        Ok(group)
    }

    pub async fn update_profile(&self, display_name: &str, avatar_ref: &str) -> Result<Identity, MeshError> {
        let session = self.session()?;
        let updated = {
            let mut identity = session.identity.write();
            identity.display_name = display_name.trim().to_string();
            identity.avatar_ref = avatar_ref.to_string();
            identity.clone()
        };
        session.rendezvous.update_identity(updated.clone())?;
        Ok(updated)
    }

    /// Open a link to a roster member by identity id.
    pub async fn connect_to(&self, id: &str) -> Result<(), MeshError> {
        let session = self.session()?;
        let id = Identity::normalize_id(id);
        let address = session
            .roster
            .get(&id)
            .map(|e| e.address.clone())
            .ok_or_else(|| MeshError::ConnectionFailed {
                address: id.clone(),
                reason: "not in roster".to_string(),
            })?;
        session.manager.connect(&address).await
    }

    /// Close every link and the rendezvous session. Groups are kept for the next join.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let session = self.session.write().take().ok_or(MeshError::NotJoined)?;
        session.shutdown();
        info!("👋 Left mesh ({})", session.address);
        Ok(())
    }
}

impl Session {
    fn local_id(&self) -> String {
        self.identity.read().id.clone()
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.manager.shutdown();
        self.rendezvous.close();
        self.roster.clear();
    }

    /// Cache a roster entry and make its address dialable.
    fn remember(&self, entry: RosterEntry) {
        if entry.address == self.address {
            return;
        }
        self.manager
            .learn_endpoint(entry.address.clone(), entry.endpoint.clone());
        self.roster.insert(entry.identity.id.clone(), entry);
    }

    fn announce_group(&self, group: &Group) -> usize {
        let message = PeerMessage::GroupSync {
            group: group.clone(),
        };
        let local_id = self.local_id();
        let mut announced = 0;
        for member in group.members.iter().filter(|m| **m != local_id) {
            let Some(address) = self.roster.get(member).map(|e| e.address.clone()) else {
                continue;
            };
            if self.manager.send_message(&message, Some(&address)).is_ok() {
                announced += 1;
            }
        }
        announced
    }

    fn accept_group(&self, from: &Address, group: Group) {
        let local_id = self.local_id();
        if !group.has_member(&local_id) {
            debug!("Ignoring group {} from {}: not a member", group.id, from);
            return;
        }
        if self.groups.contains_key(&group.id) {
            return;
        }
        self.groups.insert(group.id.clone(), group.clone());
        if let Err(e) = self.rendezvous.join_room(&group.id) {
            warn!("Failed to join room {}: {}", group.id, e);
        }
        info!("👥 Joined group {} ({}) announced by {}", group.name, group.id, from);
        self.emit(MeshEvent::GroupJoined(group));
    }

    /// A peer link may only carry envelopes sent by the identity it said hello as.
    fn deliver_from_link(&self, from: &Address, envelope: Envelope) {
        let linked_id = self.manager.peer_identity(from).map(|identity| identity.id);
        if linked_id.as_deref() != Some(envelope.sender_id.as_str()) {
            warn!(
                "🚫 Dropping envelope {} from {}: sender {} does not match the link",
                envelope.id, from, envelope.sender_id
            );
            return;
        }
        self.deliver(envelope, Route::Direct);
    }

    /// Filter, de-duplicate and decrypt one inbound envelope.
    fn deliver(&self, envelope: Envelope, route: Route) {
        if !envelope.is_well_formed() {
            warn!("⚠️ Dropping malformed envelope {}", envelope.id);
            return;
        }

        let local_id = self.local_id();
        if envelope.sender_id == local_id {
            return;
        }
        let addressed_to_us = match envelope.kind {
            EnvelopeKind::Direct => envelope.recipient_id.as_deref() == Some(local_id.as_str()),
            EnvelopeKind::Group => envelope
                .group_id
                .as_deref()
                .and_then(|id| self.groups.get(id).map(|g| g.has_member(&local_id)))
                .unwrap_or(false),
        };
        if !addressed_to_us {
            debug!("Dropping envelope {} not addressed to us", envelope.id);
            return;
        }

        if self.seen.check_and_insert(&envelope.id) {
            debug!("Duplicate envelope {} via {:?}", envelope.id, route);
            return;
        }

        let (text, decryption_failed) = if envelope.encrypted {
            match KeyService::decrypt(&envelope.payload, &self.private_key) {
                Ok(text) => (text, false),
                Err(e) => {
                    warn!("❌ Could not decrypt {} from {}: {}", envelope.id, envelope.sender_id, e);
                    (DECRYPTION_FAILED_MARKER.to_string(), true)
                }
            }
        } else {
            (envelope.payload, false)
        };

        self.emit(MeshEvent::Message(ReceivedMessage {
            id: envelope.id,
            kind: envelope.kind,
            sender_id: envelope.sender_id,
            group_id: envelope.group_id,
            text,
            encrypted: envelope.encrypted,
            decryption_failed,
            timestamp: envelope.timestamp,
            route,
        }));
    }

    fn handle_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::NodeJoined { entry } => {
                info!("👋 {} joined ({})", entry.identity.id, entry.address);
                self.remember(entry.clone());
                self.emit(MeshEvent::PeerJoined(entry));
            }
            ServerMessage::NodeUpdated { entry } => {
                debug!("🔄 {} updated their profile", entry.identity.id);
                self.remember(entry.clone());
                self.emit(MeshEvent::PeerUpdated(entry));
            }
            ServerMessage::NodeLeft { address, id } => {
                info!("👋 {} left ({})", id, address);
                self.roster.remove_if(&id, |_, e| e.address == address);
                self.manager.forget_endpoint(&address);
                // No link may outlive the roster entry behind it
                self.manager.close(&address);
                self.emit(MeshEvent::PeerLeft { address, id });
            }
            ServerMessage::Relayed { from, envelope } => {
                debug!("📨 Relayed envelope {} from {}", envelope.id, from);
                self.deliver(envelope, Route::Relayed);
            }
            ServerMessage::Pong { nonce } => debug!("Pong {}", nonce),
            ServerMessage::Error { reason } => warn!("⚠️ Rendezvous error: {}", reason),
            other => warn!("Unexpected {} from rendezvous", other.message_type()),
        }
    }
}

/// Route connection-manager events into the session. Handlers hold a weak
/// reference so the session and its manager do not keep each other alive.
fn wire_handlers(session: &Arc<Session>) {
    let manager = &session.manager;

    let weak = Arc::downgrade(session);
    manager.on(EventKind::EnvelopeReceived, move |event| {
        if let (Some(session), PeerEvent::EnvelopeReceived { from, envelope }) = (upgrade(&weak), event) {
            session.deliver_from_link(from, envelope.clone());
        }
    });

    let weak = Arc::downgrade(session);
    manager.on(EventKind::PeerConnected, move |event| {
        if let (Some(session), PeerEvent::PeerConnected { address, identity }) = (upgrade(&weak), event) {
            session.emit(MeshEvent::PeerConnected {
                address: address.clone(),
                id: identity.id.clone(),
            });
            // Late joiners learn about groups they belong to
            let groups: Vec<Group> = session
                .groups
                .iter()
                .filter(|g| g.has_member(&identity.id))
                .map(|g| g.value().clone())
                .collect();
            for group in groups {
                let _ = session
                    .manager
                    .send_message(&PeerMessage::GroupSync { group }, Some(address));
            }
        }
    });

    let weak = Arc::downgrade(session);
    manager.on(EventKind::PeerDisconnected, move |event| {
        if let (Some(session), PeerEvent::PeerDisconnected { address }) = (upgrade(&weak), event) {
            session.emit(MeshEvent::PeerDisconnected {
                address: address.clone(),
            });
        }
    });

    let weak = Arc::downgrade(session);
    manager.on(EventKind::GroupAnnounced, move |event| {
        if let (Some(session), PeerEvent::GroupAnnounced { from, group }) = (upgrade(&weak), event) {
            session.accept_group(from, group.clone());
        }
    });

    manager.on(EventKind::ConnectionFailed, |event| {
        if let PeerEvent::ConnectionFailed { address, reason } = event {
            debug!("Link to {} failed: {}", address, reason);
        }
    });
}

fn upgrade(weak: &Weak<Session>) -> Option<Arc<Session>> {
    weak.upgrade()
        .filter(|s| !s.closing.load(Ordering::SeqCst))
}

async fn pump_rendezvous(session: Arc<Session>, mut inbound: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(msg) = inbound.recv().await {
        session.handle_server_message(msg);
    }
    if !session.closing.load(Ordering::SeqCst) {
        warn!("🔌 Lost rendezvous session; re-join required");
        // Our roster entry is gone server-side
        let closed = session.manager.close_all();
        session.roster.clear();
        debug!("Closed {} link(s) after losing the rendezvous", closed);
        session.emit(MeshEvent::RendezvousLost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_join() {
        let node = MeshNode::new(NodeConfig::default());
        assert!(!node.is_joined());
        assert!(node.address().is_none());
        assert!(node.roster().is_empty());
        assert!(matches!(
            node.send_direct("bob", "hi").await,
            Err(MeshError::NotJoined)
        ));
        assert!(matches!(
            node.create_group("crew", vec!["bob".to_string()]).await,
            Err(MeshError::NotJoined)
        ));
        assert!(matches!(node.leave().await, Err(MeshError::NotJoined)));
    }

    #[tokio::test]
    async fn test_empty_identity_rejected_before_network() {
        let node = MeshNode::new(NodeConfig::default());
        let result = node.join(Identity::new("   ", "")).await;
        assert!(matches!(result, Err(MeshError::Registration(_))));
    }

    #[tokio::test]
    async fn test_unreachable_rendezvous_is_connection_failed() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let config = NodeConfig {
            rendezvous_address: format!("127.0.0.1:{}", port),
            register_timeout_secs: 2,
            ..NodeConfig::default()
        };
        let node = MeshNode::new(config);
        let result = node.join(Identity::new("alice", "")).await;
        assert!(matches!(result, Err(MeshError::ConnectionFailed { .. })));
        assert!(!node.is_joined());
    }
}
