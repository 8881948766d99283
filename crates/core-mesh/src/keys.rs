//! Session-key management.
//!
//! Each peer carries a P-256 identity for the lifetime of the process. When a
//! neighbor's public key arrives, ECDH plus HKDF-SHA256 yields the 32-byte
//! symmetric session key; both sides converge on the same key because ECDH is
//! symmetric. Keys are session-scoped and lost on restart. The public-key map
//! and the session-key map are written under one lock, so a half-derived
//! exchange is never observable.

use core_crypto::{aead, ecdh};
use core_packet::PeerId;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no session key with peer {0}")]
    Missing(PeerId),

    #[error("invalid public key from peer {0}")]
    BadPublicKey(PeerId),

    #[error("decryption failed for peer {0}")]
    Crypto(PeerId),
}

#[derive(Default)]
struct KeyMaps {
    peer_keys: HashMap<PeerId, ecdh::PublicKey>,
    shared: HashMap<PeerId, [u8; 32]>,
}

pub struct KeyAgent {
    identity: ecdh::KeyPair,
    maps: Mutex<KeyMaps>,
}

impl KeyAgent {
    pub fn new() -> Self {
        Self {
            identity: ecdh::KeyPair::generate(),
            maps: Mutex::new(KeyMaps::default()),
        }
    }

    /// Our public key in wire form (base64 over PEM SubjectPublicKeyInfo).
    pub fn public_key_b64(&self) -> String {
        self.identity.public_key_b64()
    }

    /// Record a peer public key and derive the session key in one atomic step.
    pub fn accept(&self, peer: PeerId, public_key_b64: &str) -> Result<(), KeyError> {
        let public_key =
            ecdh::public_key_from_b64(public_key_b64).map_err(|_| KeyError::BadPublicKey(peer))?;
        let shared = self.identity.agree(&public_key);
        let mut maps = self.maps.lock().unwrap();
        maps.peer_keys.insert(peer, public_key);
        maps.shared.insert(peer, shared);
        Ok(())
    }

    pub fn has_key(&self, peer: PeerId) -> bool {
        self.maps.lock().unwrap().shared.contains_key(&peer)
    }

    /// The recorded public key of a peer, if an exchange has completed.
    pub fn peer_public_key(&self, peer: PeerId) -> Option<ecdh::PublicKey> {
        self.maps.lock().unwrap().peer_keys.get(&peer).cloned()
    }

    pub fn shared_key(&self, peer: PeerId) -> Option<[u8; 32]> {
        self.maps.lock().unwrap().shared.get(&peer).copied()
    }

    pub fn key_count(&self) -> usize {
        self.maps.lock().unwrap().shared.len()
    }

    /// Encrypt a payload for `peer` under the session key
    /// (`nonce ‖ ciphertext ‖ tag` wire format).
    pub fn encrypt(&self, peer: PeerId, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let key = self.shared_key(peer).ok_or(KeyError::Missing(peer))?;
        Ok(aead::seal_prefixed(&key, plaintext))
    }

    /// Decrypt a payload received from `peer`.
    pub fn decrypt(&self, peer: PeerId, wire: &[u8]) -> Result<Vec<u8>, KeyError> {
        let key = self.shared_key(peer).ok_or(KeyError::Missing(peer))?;
        aead::open_prefixed(&key, wire).map_err(|_| KeyError::Crypto(peer))
    }
}

impl Default for KeyAgent {
    fn default() -> Self {
        Self::new()
    }
}
