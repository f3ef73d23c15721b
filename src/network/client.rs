//! Node side of a rendezvous session.
//!
//! `register` performs the handshake and then hands back a cloneable client
//! for outgoing requests plus a channel of everything the server pushes.
//! The channel closing means the session is gone and the node must re-join.

use crate::error::MeshError;
use crate::network::message::{ClientMessage, ServerMessage};
use crate::network::wire::{read_message, write_message, Frame};
use crate::types::{Address, Envelope, Identity, RosterEntry};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_FAILED_PARSES: u32 = 3;

/// Result of a successful `register`.
#[derive(Debug, Clone)]
pub struct Registration {
    pub address: Address,
    /// Every other node online at registration time
    pub roster: Vec<RosterEntry>,
}

#[derive(Clone)]
pub struct RendezvousClient {
    server: String,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    cancel: CancellationToken,
}

impl RendezvousClient {
    pub async fn register(
        server_addr: &str,
        identity: &Identity,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<(Self, Registration, mpsc::UnboundedReceiver<ServerMessage>), MeshError> {
        let (reader, writer, registration) =
            match tokio::time::timeout(timeout, handshake(server_addr, identity, endpoint)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(MeshError::ConnectionFailed {
                        address: server_addr.to_string(),
                        reason: format!("no answer within {}s", timeout.as_secs_f32()),
                    })
                }
            };

        tracing::info!(
            "✅ Registered with {} as {} ({} peer(s) online)",
            server_addr,
            registration.address,
            registration.roster.len()
        );

        let cancel = CancellationToken::new();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(writer, outbox_rx, cancel.clone()));
        tokio::spawn(read_loop(reader, inbound_tx, cancel.clone()));

        let client = Self {
            server: server_addr.to_string(),
            outbox,
            cancel,
        };
        Ok((client, registration, inbound_rx))
    }

    pub fn send(&self, msg: ClientMessage) -> Result<(), MeshError> {
        self.outbox
            .send(msg)
            .map_err(|_| MeshError::Protocol("rendezvous session closed".to_string()))
    }

    pub fn update_identity(&self, identity: Identity) -> Result<(), MeshError> {
        self.send(ClientMessage::UpdateIdentity { identity })
    }

    pub fn relay(&self, envelope: Envelope) -> Result<(), MeshError> {
        self.send(ClientMessage::Relay { envelope })
    }

    pub fn join_room(&self, room_id: &str) -> Result<(), MeshError> {
        self.send(ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })
    }

    pub fn leave_room(&self, room_id: &str) -> Result<(), MeshError> {
        self.send(ClientMessage::LeaveRoom {
            room_id: room_id.to_string(),
        })
    }

    pub fn ping(&self, nonce: u64) -> Result<(), MeshError> {
        self.send(ClientMessage::Ping { nonce })
    }

    /// Drop the session. The server notices the closed socket and tears down our entry.
    pub fn close(&self) {
        tracing::debug!("Closing rendezvous session with {}", self.server);
        self.cancel.cancel();
    }
}

async fn handshake(
    server_addr: &str,
    identity: &Identity,
    endpoint: &str,
) -> Result<(BufReader<OwnedReadHalf>, BufWriter<OwnedWriteHalf>, Registration), MeshError> {
    let stream = TcpStream::connect(server_addr)
        .await
        .map_err(|e| MeshError::ConnectionFailed {
            address: server_addr.to_string(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let register = ClientMessage::Register {
        identity: identity.clone(),
        endpoint: endpoint.to_string(),
    };
    write_message(&mut writer, &register)
        .await
        .map_err(MeshError::Protocol)?;

    match read_message::<_, ServerMessage>(&mut reader)
        .await
        .map_err(MeshError::Protocol)?
    {
        Some(Frame::Message(ServerMessage::Registered { address, roster })) => {
            Ok((reader, writer, Registration { address, roster }))
        }
        Some(Frame::Message(ServerMessage::Rejected { reason })) => Err(MeshError::Registration(reason)),
        Some(Frame::Message(other)) => Err(MeshError::Protocol(format!(
            "expected registration reply, got {}",
            other.message_type()
        ))),
        Some(Frame::Malformed(e)) => Err(MeshError::Protocol(e)),
        None => Err(MeshError::ConnectionFailed {
            address: server_addr.to_string(),
            reason: "server closed the session".to_string(),
        }),
    }
}

async fn write_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut outbox: mpsc::UnboundedReceiver<ClientMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outbox.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write_message(&mut writer, &msg).await {
                        tracing::warn!("❌ Rendezvous write failed: {}", e);
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

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
) {
    let mut failed_parse_count = 0;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_message::<_, ServerMessage>(&mut reader) => frame,
        };
        match frame {
            Ok(Some(Frame::Message(msg))) => {
                failed_parse_count = 0;
                tracing::debug!("📥 Rendezvous {}", msg.message_type());
                if inbound.send(msg).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Malformed(e))) => {
                failed_parse_count += 1;
                tracing::warn!("❌ Unparseable rendezvous frame {}: {}", failed_parse_count, e);
                if failed_parse_count >= MAX_FAILED_PARSES {
                    break;
                }
            }
            Ok(None) => {
                tracing::warn!("🔌 Rendezvous server closed the session");
                break;
            }
            Err(e) => {
                tracing::warn!("❌ Rendezvous read error: {}", e);
                break;
            }
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::RendezvousServer;
    use std::net::SocketAddr;

    async fn spawn_server() -> (SocketAddr, CancellationToken) {
        let server = RendezvousServer::bind("127.0.0.1:0", 64).await.unwrap();
        let addr = server.local_addr().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(server.run(token.clone()));
        (addr, token)
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_failed() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let result = RendezvousClient::register(
            &addr.to_string(),
            &Identity::new("alice", ""),
            "127.0.0.1:1",
            Duration::from_secs(2),
        )
        .await;
        assert!(matches!(result, Err(MeshError::ConnectionFailed { .. })));
    }

    #[tokio::test]
    async fn test_register_then_ping() {
        let (addr, token) = spawn_server().await;
        let (client, registration, mut inbound) = RendezvousClient::register(
            &addr.to_string(),
            &Identity::new("alice", ""),
            "127.0.0.1:1",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(registration.roster.is_empty());

        client.ping(7).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap();
        assert_eq!(reply, Some(ServerMessage::Pong { nonce: 7 }));

        client.close();
        token.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_id_is_registration_error() {
        let (addr, token) = spawn_server().await;
        let server = addr.to_string();
        let (_first, _, _rx) =
            RendezvousClient::register(&server, &Identity::new("alice", ""), "127.0.0.1:1", Duration::from_secs(5))
                .await
                .unwrap();

        let second =
            RendezvousClient::register(&server, &Identity::new("Alice", ""), "127.0.0.1:2", Duration::from_secs(5))
                .await;
        assert!(matches!(second, Err(MeshError::Registration(_))));
        token.cancel();
    }
}
