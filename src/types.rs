//! Core data model shared by the rendezvous server, peer links and the facade.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Session-scoped connection handle assigned by the rendezvous server.
///
/// The same identity gets a new address every session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Identity {
    /// Build an identity from a human-chosen alias; the id is normalized.
    pub fn new(alias: &str, avatar_ref: impl Into<String>) -> Self {
        Self {
            id: Self::normalize_id(alias),
            display_name: alias.trim().to_string(),
            avatar_ref: avatar_ref.into(),
            public_key: None,
        }
    }

    /// Lower-cases the alias and replaces whitespace runs with `_`.
    pub fn normalize_id(alias: &str) -> String {
        alias
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("_")
            .to_lowercase()
    }

    /// Merge mutable profile fields from `patch`. The id never changes.
    pub fn merge(&mut self, patch: &Identity) {
        if patch.id != self.id {
            tracing::warn!(
                "⚠️ Ignoring id change {} → {} in identity update",
                self.id,
                patch.id
            );
        }
        self.display_name = patch.display_name.clone();
        self.avatar_ref = patch.avatar_ref.clone();
        if patch.public_key.is_some() {
            self.public_key = patch.public_key.clone();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub identity: Identity,
    pub address: Address,
    /// Socket address where the node accepts peer links.
    pub endpoint: String,
    /// Unix millis of the last frame seen from this session.
    pub last_seen: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Group,
    Direct,
}

/// Wire-level unit of message transport between nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub payload: String,
    pub encrypted: bool,
    pub timestamp: i64,
    pub id: String,
}

impl Envelope {
    pub fn direct(sender_id: &str, recipient_id: &str, payload: String, encrypted: bool) -> Self {
        Self {
            kind: EnvelopeKind::Direct,
            sender_id: sender_id.to_string(),
            group_id: None,
            recipient_id: Some(recipient_id.to_string()),
            payload,
            encrypted,
            timestamp: chrono::Utc::now().timestamp_millis(),
            id: new_envelope_id(),
        }
    }

    /// Group payloads are never individually encrypted.
    pub fn group(sender_id: &str, group_id: &str, payload: String) -> Self {
        Self {
            kind: EnvelopeKind::Group,
            sender_id: sender_id.to_string(),
            group_id: Some(group_id.to_string()),
            recipient_id: None,
            payload,
            encrypted: false,
            timestamp: chrono::Utc::now().timestamp_millis(),
            id: new_envelope_id(),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        if self.id.is_empty() || self.sender_id.is_empty() {
            return false;
        }
        match self.kind {
            EnvelopeKind::Direct => self.recipient_id.is_some(),
            EnvelopeKind::Group => self.group_id.is_some() && !self.encrypted,
        }
    }
}

/// Random 64-bit envelope id, hex encoded.
pub fn new_envelope_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: BTreeSet<String>,
}

impl Group {
    pub fn new(name: &str, members: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: format!("grp-{}", new_envelope_id()),
            name: name.to_string(),
            members: members.into_iter().collect(),
        }
    }

    pub fn has_member(&self, id: &str) -> bool {
        self.members.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_id() {
        assert_eq!(Identity::normalize_id("Alice Smith"), "alice_smith");
        assert_eq!(Identity::normalize_id("  Bob  "), "bob");
        assert_eq!(Identity::normalize_id("   "), "");
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let env = Envelope::direct("bob", "alice", "hi".to_string(), false);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "direct");
        assert_eq!(json["senderId"], "bob");
        assert_eq!(json["recipientId"], "alice");
        assert!(json.get("groupId").is_none());
        assert_eq!(json["encrypted"], false);
    }

    #[test]
    fn test_group_envelope_never_encrypted() {
        let env = Envelope::group("alice", "grp-1", "hello".to_string());
        assert!(!env.encrypted);
        assert!(env.is_well_formed());

        let mut tampered = env.clone();
        tampered.encrypted = true;
        assert!(!tampered.is_well_formed());
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = Envelope::group("alice", "g", String::new());
        let b = Envelope::group("alice", "g", String::new());
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 16);
    }

    #[test]
    fn test_identity_merge_keeps_id() {
        let mut original = Identity::new("alice", "a.png");
        let mut patch = Identity::new("mallory", "m.png");
        patch.public_key = Some("key".to_string());
        original.merge(&patch);
        assert_eq!(original.id, "alice");
        assert_eq!(original.avatar_ref, "m.png");
        assert_eq!(original.public_key.as_deref(), Some("key"));
    }
}
