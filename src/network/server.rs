//! Rendezvous server: accepts node sessions and forwards their requests to the
//! roster actor. One task per session reads frames; a second task drains the
//! session's outbox to the socket.

use crate::network::message::{ClientMessage, ServerMessage};
use crate::network::roster::RosterHandle;
use crate::network::wire::{read_message, write_message, Frame};
use crate::types::Address;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a new session has to send its `register` frame
const REGISTER_DEADLINE: Duration = Duration::from_secs(30);
const MAX_FAILED_PARSES: u32 = 3;

pub struct RendezvousServer {
    listener: TcpListener,
    roster: RosterHandle,
    roster_task: JoinHandle<()>,
}

impl RendezvousServer {
    pub async fn bind(bind_addr: &str, command_buffer: usize) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(bind_addr).await?;
        let (roster, roster_task) = RosterHandle::spawn(command_buffer);
        Ok(Self {
            listener,
            roster,
            roster_task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn roster(&self) -> RosterHandle {
        self.roster.clone()
    }

    /// Accept sessions until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        tracing::info!("📡 Rendezvous server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let roster = self.roster.clone();
            let session_shutdown = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = handle_session(stream, addr, roster, session_shutdown).await {
                    tracing::debug!("Session from {} ended: {}", addr, e);
                }
            });
        }

        tracing::info!("🛑 Rendezvous server stopped accepting sessions");
        drop(self.roster);
        let _ = self.roster_task.await;
        Ok(())
    }
}

async fn handle_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    roster: RosterHandle,
    shutdown: CancellationToken,
) -> Result<(), String> {
    tracing::info!("🔌 New session from: {}", peer_addr);
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    // First message MUST be a registration
    let first = tokio::time::timeout(
        REGISTER_DEADLINE,
        read_message::<_, ClientMessage>(&mut reader),
    )
    .await
    .map_err(|_| "no registration before deadline".to_string())??;

    let (identity, endpoint) = match first {
        Some(Frame::Message(ClientMessage::Register { identity, endpoint })) => (identity, endpoint),
        Some(Frame::Message(other)) => {
            tracing::warn!(
                "🚫 Rejecting {} - first message must be register, got {}",
                peer_addr,
                other.message_type()
            );
            reject(&mut writer, "first message must be register").await;
            return Err("no registration".to_string());
        }
        Some(Frame::Malformed(e)) => {
            tracing::warn!("🚫 Rejecting {} - malformed registration: {}", peer_addr, e);
            reject(&mut writer, "malformed registration").await;
            return Err(e);
        }
        None => return Err("closed before registering".to_string()),
    };

    let sender_id = identity.id.clone();
    let endpoint = resolve_endpoint(&endpoint, peer_addr);
    let (tx, rx) = mpsc::unbounded_channel();

    let (address, others) = match roster.register(identity, endpoint, tx.clone()).await {
        Ok(registered) => registered,
        Err(e) => {
            tracing::warn!("🚫 Registration from {} rejected: {}", peer_addr, e);
            reject(&mut writer, &e.to_string()).await;
            return Err(e.to_string());
        }
    };

    let registered = ServerMessage::Registered {
        address: address.clone(),
        roster: others,
    };
    if let Err(e) = write_message(&mut writer, &registered).await {
        let _ = roster.disconnect(address).await;
        return Err(e);
    }

    let writer_task = tokio::spawn(write_loop(writer, rx));
    let outcome = read_loop(&mut reader, &address, &sender_id, &roster, &tx, shutdown).await;

    // Teardown is a single actor command, then the outbox drains and closes
    if let Err(e) = roster.disconnect(address.clone()).await {
        tracing::warn!("Failed to remove {} from roster: {}", address, e);
    }
    drop(tx);
    let _ = writer_task.await;

    tracing::info!("🔌 Session {} ({}) ended", address, peer_addr);
    outcome
}

async fn read_loop(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    address: &Address,
    sender_id: &str,
    roster: &RosterHandle,
    outbox: &mpsc::UnboundedSender<ServerMessage>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let mut failed_parse_count = 0;

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = read_message::<_, ClientMessage>(reader) => frame?,
        };

        let msg = match frame {
            None => {
                tracing::debug!("🔌 {} disconnected (EOF)", address);
                return Ok(());
            }
            Some(Frame::Malformed(e)) => {
                failed_parse_count += 1;
                tracing::warn!(
                    "❌ Failed to parse message {} from {}: {}",
                    failed_parse_count,
                    address,
                    e
                );
                if failed_parse_count >= MAX_FAILED_PARSES {
                    tracing::warn!(
                        "🚫 Disconnecting {} after {} failed parse attempts",
                        address,
                        failed_parse_count
                    );
                    return Err("too many malformed frames".to_string());
                }
                continue;
            }
            Some(Frame::Message(msg)) => msg,
        };

        failed_parse_count = 0;
        tracing::debug!("📦 {} from {}", msg.message_type(), address);
        roster
            .touch(address.clone())
            .await
            .map_err(|e| e.to_string())?;

        match msg {
            ClientMessage::Register { .. } => {
                let _ = outbox.send(ServerMessage::Error {
                    reason: "already registered".to_string(),
                });
            }
            ClientMessage::UpdateIdentity { identity } => {
                roster
                    .update_identity(address.clone(), identity)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            ClientMessage::Relay { envelope } => {
                if !envelope.is_well_formed() {
                    let _ = outbox.send(ServerMessage::Error {
                        reason: format!("malformed envelope {}", envelope.id),
                    });
                    continue;
                }
                if envelope.sender_id != sender_id {
                    tracing::warn!(
                        "🚫 {} tried to relay as '{}'",
                        address,
                        envelope.sender_id
                    );
                    let _ = outbox.send(ServerMessage::Error {
                        reason: "sender id does not match registration".to_string(),
                    });
                    continue;
                }
                let id = envelope.id.clone();
                let delivered = roster
                    .relay(address.clone(), envelope)
                    .await
                    .map_err(|e| e.to_string())?;
                tracing::debug!("📨 Relayed {} from {} to {} session(s)", id, address, delivered);
            }
            ClientMessage::JoinRoom { room_id } => {
                roster
                    .join_room(address.clone(), room_id)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            ClientMessage::LeaveRoom { room_id } => {
                roster
                    .leave_room(address.clone(), room_id)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            ClientMessage::Ping { nonce } => {
                let _ = outbox.send(ServerMessage::Pong { nonce });
            }
        }
    }
}

async fn write_loop(mut writer: BufWriter<OwnedWriteHalf>, mut rx: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            tracing::warn!("Failed to write {}: {}", msg.message_type(), e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn reject(writer: &mut BufWriter<OwnedWriteHalf>, reason: &str) {
    let msg = ServerMessage::Rejected {
        reason: reason.to_string(),
    };
    let _ = write_message(writer, &msg).await;
    let _ = writer.shutdown().await;
}

/// Nodes listening on a wildcard address advertise e.g. `0.0.0.0:7000`;
/// substitute the address the session actually came from.
pub fn resolve_endpoint(endpoint: &str, peer_addr: SocketAddr) -> String {
    match endpoint.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => SocketAddr::new(peer_addr.ip(), addr.port()).to_string(),
        _ => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identity;

    async fn spawn_server() -> (SocketAddr, CancellationToken) {
        let server = RendezvousServer::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));
        (addr, token)
    }

    async fn open(
        addr: SocketAddr,
    ) -> (
        BufReader<tokio::net::tcp::OwnedReadHalf>,
        BufWriter<OwnedWriteHalf>,
    ) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        (BufReader::new(r), BufWriter::new(w))
    }

    async fn next(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> ServerMessage {
        match tokio::time::timeout(Duration::from_secs(5), read_message::<_, ServerMessage>(reader))
            .await
            .unwrap()
            .unwrap()
        {
            Some(Frame::Message(msg)) => msg,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_resolve_endpoint_substitutes_wildcard() {
        let peer: SocketAddr = "10.1.2.3:55555".parse().unwrap();
        assert_eq!(resolve_endpoint("0.0.0.0:7000", peer), "10.1.2.3:7000");
        assert_eq!(resolve_endpoint("192.168.0.9:7000", peer), "192.168.0.9:7000");
        assert_eq!(resolve_endpoint("node.local:7000", peer), "node.local:7000");
    }

    #[tokio::test]
    async fn test_first_frame_must_be_register() {
        let (addr, token) = spawn_server().await;
        let (mut reader, mut writer) = open(addr).await;

        write_message(&mut writer, &ClientMessage::Ping { nonce: 1 })
            .await
            .unwrap();
        assert!(matches!(next(&mut reader).await, ServerMessage::Rejected { .. }));
        token.cancel();
    }

    #[tokio::test]
    async fn test_register_ping_and_spoofed_relay() {
        let (addr, token) = spawn_server().await;
        let (mut reader, mut writer) = open(addr).await;

        let register = ClientMessage::Register {
            identity: Identity::new("alice", ""),
            endpoint: "127.0.0.1:1".to_string(),
        };
        write_message(&mut writer, &register).await.unwrap();
        match next(&mut reader).await {
            ServerMessage::Registered { address, roster } => {
                assert!(address.as_str().starts_with("imp-alice-"));
                assert!(roster.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        write_message(&mut writer, &ClientMessage::Ping { nonce: 42 })
            .await
            .unwrap();
        assert_eq!(next(&mut reader).await, ServerMessage::Pong { nonce: 42 });

        let spoofed = crate::types::Envelope::direct("mallory", "bob", "x".to_string(), false);
        write_message(&mut writer, &ClientMessage::Relay { envelope: spoofed })
            .await
            .unwrap();
        assert!(matches!(next(&mut reader).await, ServerMessage::Error { .. }));
        token.cancel();
    }

    #[tokio::test]
    async fn test_mixed_case_register_rejected() {
        let (addr, token) = spawn_server().await;
        let (mut reader, mut writer) = open(addr).await;

        let register = ClientMessage::Register {
            identity: Identity {
                id: "Alice".to_string(),
                display_name: "Alice".to_string(),
                avatar_ref: String::new(),
                public_key: None,
            },
            endpoint: "127.0.0.1:1".to_string(),
        };
        write_message(&mut writer, &register).await.unwrap();
        assert!(matches!(next(&mut reader).await, ServerMessage::Rejected { .. }));
        token.cancel();
    }
}
