use crate::types::Address;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("No open connection to {0}")]
    NoRoute(Address),

    #[error("Connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Registration rejected: {0}")]
    Registration(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Node has not joined the mesh")]
    NotJoined,

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for MeshError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Encryption(reason) => MeshError::Encryption(reason),
            CryptoError::Decryption(reason) => MeshError::Decryption(reason),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
}
