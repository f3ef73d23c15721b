use crate::types::{Address, Envelope, Group, Identity, RosterEntry};
use serde::{Deserialize, Serialize};

/// Frames a node sends to the rendezvous server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // First message on a session must be a registration
    Register {
        identity: Identity,
        /// Socket address where this node accepts peer links
        endpoint: String,
    },
    UpdateIdentity {
        identity: Identity,
    },
    Relay {
        envelope: Envelope,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    Ping {
        nonce: u64,
    },
}

/// Frames the rendezvous server sends to a node.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        address: Address,
        /// Every other live entry at registration time
        roster: Vec<RosterEntry>,
    },
    Rejected {
        reason: String,
    },
    NodeJoined {
        entry: RosterEntry,
    },
    NodeUpdated {
        entry: RosterEntry,
    },
    NodeLeft {
        address: Address,
        id: String,
    },
    Relayed {
        from: Address,
        envelope: Envelope,
    },
    Pong {
        nonce: u64,
    },
    Error {
        reason: String,
    },
}

/// Frames exchanged over a direct peer link.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    // Both ends send hello before the link is open
    Hello {
        address: Address,
        identity: Identity,
    },
    Envelope(Envelope),
    GroupSync {
        group: Group,
    },
}

impl ClientMessage {
    /// Get the message type name as a string (for logging/debugging)
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "Register",
            ClientMessage::UpdateIdentity { .. } => "UpdateIdentity",
            ClientMessage::Relay { .. } => "Relay",
            ClientMessage::JoinRoom { .. } => "JoinRoom",
            ClientMessage::LeaveRoom { .. } => "LeaveRoom",
            ClientMessage::Ping { .. } => "Ping",
        }
    }
}

impl ServerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "Registered",
            ServerMessage::Rejected { .. } => "Rejected",
            ServerMessage::NodeJoined { .. } => "NodeJoined",
            ServerMessage::NodeUpdated { .. } => "NodeUpdated",
            ServerMessage::NodeLeft { .. } => "NodeLeft",
            ServerMessage::Relayed { .. } => "Relayed",
            ServerMessage::Pong { .. } => "Pong",
            ServerMessage::Error { .. } => "Error",
        }
    }
}

impl PeerMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "Hello",
            PeerMessage::Envelope(_) => "Envelope",
            PeerMessage::GroupSync { .. } => "GroupSync",
        }
    }
}
