//! Peer mesh layer: a rendezvous server for discovery and relay, direct
//! peer links with per-link reader/writer tasks, sealed-box encryption for
//! direct messages, and a facade that ties them together.

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod network;
pub mod shutdown;
pub mod types;

pub use config::Config;
pub use crypto::KeyService;
pub use error::{AppError, CryptoError, MeshError};
pub use mesh::{MeshEvent, MeshNode, ReceivedMessage, Route, SendReceipt, DECRYPTION_FAILED_MARKER};
pub use network::server::RendezvousServer;
pub use types::{Address, Envelope, EnvelopeKind, Group, Identity, RosterEntry};
