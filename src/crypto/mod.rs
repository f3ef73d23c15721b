//! Per-session key material and the direct-message encryption envelope.

pub mod keys;

pub use keys::{KeyService, PrivateKey, PublicKey, MAX_PLAINTEXT_LEN};
