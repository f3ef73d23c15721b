//! Key Service: per-session X25519 keypairs and sealed direct-message payloads.
//!
//! A payload is sealed to the recipient's public key with an ephemeral X25519
//! agreement, a SHA-256 derived key and AES-256-GCM. The text form is
//! base64(ephemeral_public ‖ nonce ‖ ciphertext+tag).
//!
//! Plaintext length is capped at [`MAX_PLAINTEXT_LEN`] bytes so direct chats
//! keep the same bound as the RSA-OAEP scheme they replace.

use crate::error::CryptoError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::Zeroize;

/// Largest plaintext (in bytes) accepted by [`KeyService::encrypt`].
pub const MAX_PLAINTEXT_LEN: usize = 190;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_DOMAIN: &[u8] = b"imp-mesh/direct-envelope/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }
}

/// Private half of a session keypair. Zeroized on drop.
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

pub struct KeyService;

impl KeyService {
    /// Produce a fresh keypair. Nothing is cached.
    pub fn generate_keypair() -> (PublicKey, PrivateKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let private = PrivateKey(secret);
        (private.public_key(), private)
    }

    pub fn export_public_key(public_key: &PublicKey) -> String {
        BASE64.encode(public_key.as_bytes())
    }

    pub fn import_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Encryption(format!("malformed public key: {}", e)))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::Encryption(format!(
                "malformed public key: expected {} bytes, got {}",
                KEY_LEN,
                b.len()
            ))
        })?;
        Ok(PublicKey(x25519_dalek::PublicKey::from(bytes)))
    }

    /// Seal `plaintext` for the holder of `public_key`.
    pub fn encrypt(plaintext: &str, public_key: &PublicKey) -> Result<String, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CryptoError::Encryption(format!(
                "plaintext too large: {} bytes (max: {})",
                plaintext.len(),
                MAX_PLAINTEXT_LEN
            )));
        }

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&public_key.0);
        if !shared.was_contributory() {
            return Err(CryptoError::Encryption(
                "malformed public key: low-order point".to_string(),
            ));
        }

        let mut key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), public_key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Encryption(format!("cipher init: {}", e)));
        key.zeroize();
        let cipher = cipher?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM seal failed: {}", e)))?;

        let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// Open a payload sealed by [`KeyService::encrypt`].
    ///
    /// Any framing, integrity or encoding failure is a `Decryption` error.
    pub fn decrypt(ciphertext: &str, private_key: &PrivateKey) -> Result<String, CryptoError> {
        let data = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {}", e)))?;
        if data.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "ciphertext too short: {} bytes",
                data.len()
            )));
        }

        let (ephemeral_bytes, rest) = data.split_at(KEY_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let mut ephemeral = [0u8; KEY_LEN];
        ephemeral.copy_from_slice(ephemeral_bytes);
        let ephemeral_public = x25519_dalek::PublicKey::from(ephemeral);

        let shared = private_key.0.diffie_hellman(&ephemeral_public);
        let recipient_public = private_key.public_key();
        let mut key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient_public.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Decryption(format!("cipher init: {}", e)));
        key.zeroize();

        let plaintext = cipher?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decryption("authentication tag mismatch".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".to_string()))
    }
}

fn derive_key(shared: &[u8; KEY_LEN], ephemeral: &[u8; KEY_LEN], recipient: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(KDF_DOMAIN);
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}
