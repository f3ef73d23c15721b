//! Peer connection manager: owns every direct link of this node.
//! Uses DashMap so connect/send on unrelated peers never share a lock.
//!
//! Each link moves Pending → Open → Closed. An Open link has one reader task
//! (decodes frames and raises events) and one writer task (drains the outbox).
//! `send` only enqueues onto the outbox, it never waits on the socket.

use crate::error::MeshError;
use crate::network::events::{EventBus, EventKind, HandlerId, PeerEvent};
use crate::network::message::PeerMessage;
use crate::network::wire::{read_message, serialize_frame, write_frame, write_message, Frame};
use crate::types::{Address, Envelope, Identity};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PeerReader = BufReader<OwnedReadHalf>;
type PeerWriter = BufWriter<OwnedWriteHalf>;
type Outbox = mpsc::UnboundedSender<Arc<str>>;

/// Consecutive unparseable frames tolerated before a link is dropped
const MAX_FAILED_PARSES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

struct Connection {
    /// Distinguishes successive links to the same address
    link_id: u64,
    direction: ConnectionDirection,
    state: watch::Sender<ConnectionState>,
    outbox: Option<Outbox>,
    remote: Option<Identity>,
    cancel: CancellationToken,
}

impl Connection {
    fn pending(link_id: u64, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(ConnectionState::Pending);
        Self {
            link_id,
            direction: ConnectionDirection::Outbound,
            state,
            outbox: None,
            remote: None,
            cancel,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Install a live link into this slot and mark it Open. Returns the
    /// token of whatever link previously occupied the slot.
    fn activate(
        &mut self,
        link_id: u64,
        direction: ConnectionDirection,
        outbox: Outbox,
        remote: Identity,
        cancel: CancellationToken,
    ) -> CancellationToken {
        self.link_id = link_id;
        self.direction = direction;
        self.outbox = Some(outbox);
        self.remote = Some(remote);
        let previous = std::mem::replace(&mut self.cancel, cancel);
        self.state.send_replace(ConnectionState::Open);
        previous
    }
}

#[derive(Clone)]
struct LocalPeer {
    address: Address,
    identity: Identity,
}

impl LocalPeer {
    fn hello(&self) -> PeerMessage {
        PeerMessage::Hello {
            address: self.address.clone(),
            identity: self.identity.clone(),
        }
    }
}

enum Claim {
    AlreadyOpen,
    Wait(watch::Receiver<ConnectionState>),
    Dial(u64, CancellationToken),
}

enum InboundDecision {
    New,
    Replaced,
    Reject,
}

/// Manages the lifecycle of direct peer links (inbound/outbound)
#[derive(Clone)]
pub struct ConnectionManager {
    local: Arc<RwLock<Option<LocalPeer>>>,
    connections: Arc<DashMap<Address, Connection>>,
    /// Address → dialable endpoint, fed from rendezvous roster events
    endpoints: Arc<DashMap<Address, String>>,
    events: EventBus,
    next_link_id: Arc<AtomicU64>,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            local: Arc::new(RwLock::new(None)),
            connections: Arc::new(DashMap::new()),
            endpoints: Arc::new(DashMap::new()),
            events: EventBus::new(),
            next_link_id: Arc::new(AtomicU64::new(1)),
            connect_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Start accepting peer links as `address`.
    pub fn start(&self, listener: TcpListener, address: Address, identity: Identity) -> JoinHandle<()> {
        *self.local.write() = Some(LocalPeer { address, identity });
        let manager = self.clone();
        tokio::spawn(async move { manager.accept_loop(listener).await })
    }

    pub fn local_address(&self) -> Option<Address> {
        self.local.read().as_ref().map(|l| l.address.clone())
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, id: HandlerId) {
        self.events.off(id);
    }

    pub fn learn_endpoint(&self, address: Address, endpoint: String) {
        self.endpoints.insert(address, endpoint);
    }

    pub fn forget_endpoint(&self, address: &Address) {
        self.endpoints.remove(address);
    }

    pub fn state(&self, address: &Address) -> ConnectionState {
        self.connections
            .get(address)
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self, address: &Address) -> bool {
        self.state(address) == ConnectionState::Open
    }

    /// Get list of currently open links
    pub fn open_connections(&self) -> Vec<Address> {
        self.connections
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Open)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Open)
            .count()
    }

    pub fn peer_identity(&self, address: &Address) -> Option<Identity> {
        self.connections.get(address).and_then(|c| c.remote.clone())
    }

    pub fn direction(&self, address: &Address) -> Option<ConnectionDirection> {
        self.connections.get(address).map(|c| c.direction)
    }

    /// Open a link to `target`. No-op when already open or when `target` is us;
    /// waits for an attempt already in flight instead of dialing twice.
    pub async fn connect(&self, target: &Address) -> Result<(), MeshError> {
        let local = self.local.read().clone().ok_or(MeshError::NotJoined)?;
        if *target == local.address {
            return Ok(());
        }

        let claim = match self.connections.entry(target.clone()) {
            Entry::Occupied(mut occ) => match occ.get().state() {
                ConnectionState::Open => Claim::AlreadyOpen,
                ConnectionState::Pending => Claim::Wait(occ.get().state.subscribe()),
                ConnectionState::Closed => {
                    let link_id = self.next_link_id();
                    let cancel = self.cancel.child_token();
                    occ.insert(Connection::pending(link_id, cancel.clone()));
                    Claim::Dial(link_id, cancel)
                }
            },
            Entry::Vacant(vac) => {
                let link_id = self.next_link_id();
                let cancel = self.cancel.child_token();
                vac.insert(Connection::pending(link_id, cancel.clone()));
                Claim::Dial(link_id, cancel)
            }
        };

        let (link_id, cancel) = match claim {
            Claim::AlreadyOpen => return Ok(()),
            Claim::Wait(rx) => return self.await_pending(target, rx).await,
            Claim::Dial(link_id, cancel) => (link_id, cancel),
        };

        let endpoint = match self.endpoints.get(target) {
            Some(endpoint) => endpoint.clone(),
            None => return self.fail_pending(target, link_id, "no known endpoint".to_string()),
        };

        debug!("🔗 Dialing {} at {}", target, endpoint);
        let attempt = tokio::time::timeout(self.connect_timeout, dial(&endpoint, &local, target)).await;
        match attempt {
            Ok(Ok((reader, writer, remote))) => {
                self.finish_outbound(target, link_id, cancel, reader, writer, remote)
            }
            Ok(Err(reason)) => self.fail_pending(target, link_id, reason),
            Err(_) => self.fail_pending(
                target,
                link_id,
                format!("timed out after {}s", self.connect_timeout.as_secs_f32()),
            ),
        }
    }

    /// Deliver an envelope to `target`, or to every open link when `target` is None.
    /// Returns the number of links the frame was queued on.
    pub fn send(&self, envelope: &Envelope, target: Option<&Address>) -> Result<usize, MeshError> {
        self.send_message(&PeerMessage::Envelope(envelope.clone()), target)
    }

    pub fn send_message(&self, message: &PeerMessage, target: Option<&Address>) -> Result<usize, MeshError> {
        // Serialize once instead of per-peer
        let frame: Arc<str> = Arc::from(serialize_frame(message).map_err(MeshError::Protocol)?);

        match target {
            Some(address) => {
                let conn = self
                    .connections
                    .get(address)
                    .ok_or_else(|| MeshError::NoRoute(address.clone()))?;
                if conn.state() != ConnectionState::Open {
                    return Err(MeshError::NoRoute(address.clone()));
                }
                match conn.outbox.as_ref() {
                    Some(outbox) if outbox.send(frame).is_ok() => Ok(1),
                    _ => Err(MeshError::NoRoute(address.clone())),
                }
            }
            None => {
                let mut sent = 0;
                for entry in self.connections.iter() {
                    if entry.state() != ConnectionState::Open {
                        continue;
                    }
                    if let Some(outbox) = entry.outbox.as_ref() {
                        if outbox.send(frame.clone()).is_ok() {
                            sent += 1;
                        }
                    }
                }
                if sent == 0 {
                    debug!("⚠️  Broadcast {}: no open links", message.message_type());
                } else {
                    debug!("📡 Broadcast {} to {} peer(s)", message.message_type(), sent);
                }
                Ok(sent)
            }
        }
    }

    /// Close the link to `address`. Returns false if there was none.
    pub fn close(&self, address: &Address) -> bool {
        let Some((_, conn)) = self.connections.remove(address) else {
            return false;
        };
        let was_open = conn.state() == ConnectionState::Open;
        conn.cancel.cancel();
        conn.state.send_replace(ConnectionState::Closed);
        if was_open {
            info!("🔌 Closed link to {}", address);
            self.events.emit(&PeerEvent::PeerDisconnected {
                address: address.clone(),
            });
        }
        true
    }

    pub fn close_all(&self) -> usize {
        let addresses: Vec<Address> = self.connections.iter().map(|e| e.key().clone()).collect();
        addresses.iter().filter(|a| self.close(a)).count()
    }

    /// Stop accepting links and close every existing one.
    pub fn shutdown(&self) {
        let closed = self.close_all();
        self.cancel.cancel();
        self.endpoints.clear();
        info!("🛑 Connection manager stopped ({} link(s) closed)", closed);
    }

    fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn await_pending(
        &self,
        target: &Address,
        mut rx: watch::Receiver<ConnectionState>,
    ) -> Result<(), MeshError> {
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Open => return Ok(()),
                    ConnectionState::Closed => break,
                    ConnectionState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
            if self.is_open(target) {
                Ok(())
            } else {
                Err(MeshError::ConnectionFailed {
                    address: target.to_string(),
                    reason: "concurrent attempt failed".to_string(),
                })
            }
        };

        match tokio::time::timeout(self.connect_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::ConnectionFailed {
                address: target.to_string(),
                reason: "timed out waiting for concurrent attempt".to_string(),
            }),
        }
    }

    fn fail_pending(&self, target: &Address, link_id: u64, reason: String) -> Result<(), MeshError> {
        if let Some((_, conn)) = self
            .connections
            .remove_if(target, |_, c| c.link_id == link_id)
        {
            conn.state.send_replace(ConnectionState::Closed);
        } else if self.is_open(target) {
            // An inbound link from the same peer took over the slot
            return Ok(());
        }

        warn!("❌ Connection to {} failed: {}", target, reason);
        self.events.emit(&PeerEvent::ConnectionFailed {
            address: target.clone(),
            reason: reason.clone(),
        });
        Err(MeshError::ConnectionFailed {
            address: target.to_string(),
            reason,
        })
    }

    fn finish_outbound(
        &self,
        target: &Address,
        link_id: u64,
        cancel: CancellationToken,
        reader: PeerReader,
        writer: PeerWriter,
        remote: Identity,
    ) -> Result<(), MeshError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let installed = match self.connections.get_mut(target) {
            Some(mut conn) if conn.link_id == link_id && conn.state() == ConnectionState::Pending => {
                conn.activate(link_id, ConnectionDirection::Outbound, tx, remote.clone(), cancel.clone());
                true
            }
            _ => false,
        };

        if !installed {
            debug!("Dropping superseded outbound link to {}", target);
            cancel.cancel();
            return if self.is_open(target) {
                Ok(())
            } else {
                Err(MeshError::ConnectionFailed {
                    address: target.to_string(),
                    reason: "link superseded".to_string(),
                })
            };
        }

        self.spawn_link(target.clone(), link_id, cancel, reader, writer, rx);
        info!("✅ Connected to {} ({})", remote.id, target);
        self.events.emit(&PeerEvent::PeerConnected {
            address: target.clone(),
            identity: remote,
        });
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("👂 Accepting peer links on {}", addr);
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.handle_inbound(stream).await {
                                debug!("Inbound link from {} dropped: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("Peer listener stopped");
    }

    async fn handle_inbound(&self, stream: TcpStream) -> Result<(), String> {
        let local = self.local.read().clone().ok_or("not started")?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let hello = tokio::time::timeout(
            self.connect_timeout,
            read_message::<_, PeerMessage>(&mut reader),
        )
        .await
        .map_err(|_| "handshake timed out".to_string())??;

        let (address, identity) = match hello {
            Some(Frame::Message(PeerMessage::Hello { address, identity })) => (address, identity),
            Some(Frame::Message(other)) => {
                return Err(format!("first message must be Hello, got {}", other.message_type()))
            }
            Some(Frame::Malformed(e)) => return Err(format!("malformed handshake: {}", e)),
            None => return Err("closed during handshake".to_string()),
        };
        if address == local.address {
            return Err("refusing link from self".to_string());
        }

        let link_id = self.next_link_id();
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();

        let decision = match self.connections.entry(address.clone()) {
            Entry::Vacant(vac) => {
                let mut conn = Connection::pending(link_id, cancel.clone());
                conn.activate(link_id, ConnectionDirection::Inbound, tx, identity.clone(), cancel.clone());
                vac.insert(conn);
                InboundDecision::New
            }
            Entry::Occupied(mut occ) => {
                let conn = occ.get_mut();
                let state = conn.state();
                // On a simultaneous dial the link dialed by the smaller address survives
                let keep_inbound = match (state, conn.direction) {
                    (ConnectionState::Closed, _) => true,
                    (_, ConnectionDirection::Inbound) => true,
                    (_, ConnectionDirection::Outbound) => address < local.address,
                };
                if keep_inbound {
                    let previous = conn.activate(
                        link_id,
                        ConnectionDirection::Inbound,
                        tx,
                        identity.clone(),
                        cancel.clone(),
                    );
                    previous.cancel();
                    if state == ConnectionState::Open {
                        InboundDecision::Replaced
                    } else {
                        InboundDecision::New
                    }
                } else {
                    InboundDecision::Reject
                }
            }
        };

        if matches!(decision, InboundDecision::Reject) {
            debug!("Keeping our own link to {}, rejecting inbound duplicate", address);
            return Ok(());
        }

        if let Err(e) = write_message(&mut writer, &local.hello()).await {
            cancel.cancel();
            if let Some((_, conn)) = self
                .connections
                .remove_if(&address, |_, c| c.link_id == link_id)
            {
                conn.state.send_replace(ConnectionState::Closed);
                if matches!(decision, InboundDecision::Replaced) {
                    self.events.emit(&PeerEvent::PeerDisconnected { address });
                }
            }
            return Err(e);
        }

        self.spawn_link(address.clone(), link_id, cancel, reader, writer, rx);
        match decision {
            InboundDecision::New => {
                info!("✅ Accepted link from {} ({})", identity.id, address);
                self.events.emit(&PeerEvent::PeerConnected { address, identity });
            }
            _ => debug!("🔄 Replaced link to {}", address),
        }
        Ok(())
    }

    fn spawn_link(
        &self,
        address: Address,
        link_id: u64,
        cancel: CancellationToken,
        reader: PeerReader,
        writer: PeerWriter,
        outbox: mpsc::UnboundedReceiver<Arc<str>>,
    ) {
        tokio::spawn(write_loop(address.clone(), writer, outbox, cancel.clone()));
        let manager = self.clone();
        tokio::spawn(async move { manager.read_loop(address, link_id, reader, cancel).await });
    }

    async fn read_loop(self, address: Address, link_id: u64, mut reader: PeerReader, cancel: CancellationToken) {
        let mut failed_parse_count = 0;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_message::<_, PeerMessage>(&mut reader) => frame,
            };

            match frame {
                Ok(None) => {
                    debug!("🔌 Peer {} disconnected (EOF)", address);
                    break;
                }
                Ok(Some(Frame::Message(msg))) => {
                    failed_parse_count = 0;
                    self.dispatch(&address, msg);
                }
                Ok(Some(Frame::Malformed(e))) => {
                    failed_parse_count += 1;
                    warn!(
                        "❌ Failed to parse frame {} from {}: {}",
                        failed_parse_count, address, e
                    );
                    if failed_parse_count >= MAX_FAILED_PARSES {
                        warn!("🚫 Dropping {} after {} bad frames", address, failed_parse_count);
                        break;
                    }
                }
                Err(e) => {
                    warn!("❌ Read error from {}: {}", address, e);
                    break;
                }
            }
        }

        cancel.cancel();
        if let Some((_, conn)) = self
            .connections
            .remove_if(&address, |_, c| c.link_id == link_id)
        {
            conn.state.send_replace(ConnectionState::Closed);
            info!("🔌 Link to {} closed", address);
            self.events.emit(&PeerEvent::PeerDisconnected { address });
        }
    }

    /// Handlers run here, on the reader task, before the next frame is read.
    fn dispatch(&self, from: &Address, msg: PeerMessage) {
        match msg {
            PeerMessage::Envelope(envelope) => {
                debug!("📥 Envelope {} from {}", envelope.id, from);
                self.events.emit(&PeerEvent::EnvelopeReceived {
                    from: from.clone(),
                    envelope,
                });
            }
            PeerMessage::GroupSync { group } => {
                self.events.emit(&PeerEvent::GroupAnnounced {
                    from: from.clone(),
                    group,
                });
            }
            PeerMessage::Hello { .. } => {
                debug!("Ignoring repeated Hello from {}", from);
            }
        }
    }
}

async fn dial(
    endpoint: &str,
    local: &LocalPeer,
    target: &Address,
) -> Result<(PeerReader, PeerWriter, Identity), String> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| format!("connect to {}: {}", endpoint, e))?;
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    write_message(&mut writer, &local.hello()).await?;

    match read_message::<_, PeerMessage>(&mut reader).await? {
        Some(Frame::Message(PeerMessage::Hello { address, identity })) => {
            if &address != target {
                return Err(format!("{} answered as {}", endpoint, address));
            }
            Ok((reader, writer, identity))
        }
        Some(Frame::Message(other)) => Err(format!("expected Hello, got {}", other.message_type())),
        Some(Frame::Malformed(e)) => Err(format!("malformed handshake: {}", e)),
        None => Err("closed during handshake".to_string()),
    }
}

async fn write_loop(
    address: Address,
    mut writer: PeerWriter,
    mut outbox: mpsc::UnboundedReceiver<Arc<str>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbox.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!("Failed to write to {}: {}", address, e);
                        break;
                    }
                }
                None => break,
            }
        }
    }
    cancel.cancel();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    async fn started(alias: &str) -> (ConnectionManager, Address, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let address = Address::new(format!("imp-{}-test", alias));
        let manager = ConnectionManager::new(Duration::from_secs(5));
        manager.start(listener, address.clone(), Identity::new(alias, ""));
        (manager, address, endpoint)
    }

    #[tokio::test]
    async fn test_connect_before_start_fails() {
        let manager = ConnectionManager::new(Duration::from_secs(1));
        let result = manager.connect(&Address::from("imp-x-0000")).await;
        assert!(matches!(result, Err(MeshError::NotJoined)));
    }

    #[tokio::test]
    async fn test_connect_to_self_is_noop() {
        let (manager, address, _) = started("alice").await;
        manager.connect(&address).await.unwrap();
        assert_eq!(manager.connected_count(), 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_endpoint_emits_connection_failed() {
        let (manager, _, _) = started("alice").await;
        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = failures.clone();
        manager.on(EventKind::ConnectionFailed, move |e| {
            if let PeerEvent::ConnectionFailed { address, .. } = e {
                f.lock().push(address.clone());
            }
        });

        let ghost = Address::from("imp-ghost-0000");
        let result = manager.connect(&ghost).await;
        assert!(matches!(result, Err(MeshError::ConnectionFailed { .. })));
        assert_eq!(*failures.lock(), vec![ghost.clone()]);
        assert_eq!(manager.state(&ghost), ConnectionState::Closed);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_send_without_link_is_no_route() {
        let (manager, _, _) = started("alice").await;
        let env = Envelope::direct("alice", "bob", "hi".to_string(), false);
        let target = Address::from("imp-bob-0000");
        assert!(matches!(
            manager.send(&env, Some(&target)),
            Err(MeshError::NoRoute(_))
        ));
        assert_eq!(manager.send(&env, None).unwrap(), 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (alice, _, _) = started("alice").await;
        let (bob, bob_addr, bob_endpoint) = started("bob").await;
        let connected = Arc::new(Mutex::new(0));
        let c = connected.clone();
        alice.on(EventKind::PeerConnected, move |_| *c.lock() += 1);

        alice.learn_endpoint(bob_addr.clone(), bob_endpoint);
        alice.connect(&bob_addr).await.unwrap();
        alice.connect(&bob_addr).await.unwrap();

        assert_eq!(alice.state(&bob_addr), ConnectionState::Open);
        assert_eq!(alice.connected_count(), 1);
        assert_eq!(*connected.lock(), 1);
        assert_eq!(alice.peer_identity(&bob_addr).unwrap().id, "bob");
        assert_eq!(alice.direction(&bob_addr), Some(ConnectionDirection::Outbound));

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_envelope_delivered_and_disconnect_observed() {
        let (alice, alice_addr, _) = started("alice").await;
        let (bob, bob_addr, bob_endpoint) = started("bob").await;

        let (env_tx, mut env_rx) = mpsc::unbounded_channel();
        bob.on(EventKind::EnvelopeReceived, move |e| {
            if let PeerEvent::EnvelopeReceived { from, envelope } = e {
                let _ = env_tx.send((from.clone(), envelope.clone()));
            }
        });
        let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();
        bob.on(EventKind::PeerDisconnected, move |e| {
            if let PeerEvent::PeerDisconnected { address } = e {
                let _ = gone_tx.send(address.clone());
            }
        });

        alice.learn_endpoint(bob_addr.clone(), bob_endpoint);
        alice.connect(&bob_addr).await.unwrap();

        let env = Envelope::direct("alice", "bob", "hi".to_string(), false);
        assert_eq!(alice.send(&env, Some(&bob_addr)).unwrap(), 1);

        let (from, received) = tokio::time::timeout(Duration::from_secs(5), env_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, alice_addr);
        assert_eq!(received, env);

        assert!(alice.close(&bob_addr));
        let gone = tokio::time::timeout(Duration::from_secs(5), gone_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gone, alice_addr);
        assert_eq!(bob.connected_count(), 0);

        alice.shutdown();
        bob.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_link() {
        let (alice, _, _) = started("alice").await;
        let (bob, bob_addr, bob_endpoint) = started("bob").await;
        alice.learn_endpoint(bob_addr.clone(), bob_endpoint);

        let (a, b) = tokio::join!(alice.connect(&bob_addr), alice.connect(&bob_addr));
        a.unwrap();
        b.unwrap();
        assert_eq!(alice.connected_count(), 1);

        alice.shutdown();
        bob.shutdown();
    }
}
