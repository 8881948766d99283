//! Cryptography for the overlay: session-key agreement (P-256 ECDH through
//! HKDF-SHA256) and authenticated payload sealing (ChaCha20-Poly1305).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Crypto,
    BadKey,
}

pub mod aead {
    //! Per-hop payload encryption under a 32-byte session key.
    //!
    //! Sealed payloads travel as `nonce(12) || ciphertext || tag(16)` with
    //! empty AAD; the packet header stays outside the sealed region. Every
    //! seal draws a fresh random nonce, so equal plaintexts never produce
    //! equal wire bytes.

    use crate::Error;
    use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
    use ring::rand::{SecureRandom, SystemRandom};

    pub const NONCE_LEN: usize = 12;
    pub const TAG_LEN: usize = 16;

    fn session_cipher(key: &[u8; 32]) -> LessSafeKey {
        // A 32-byte key is always valid for ChaCha20-Poly1305
        LessSafeKey::new(UnboundKey::new(&CHACHA20_POLY1305, key).expect("chacha key"))
    }

    /// Seal a payload under a fresh random nonce.
    pub fn seal_prefixed(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let mut wire = vec![0u8; NONCE_LEN];
        SystemRandom::new().fill(&mut wire).expect("nonce rng");
        let nonce = Nonce::try_assume_unique_for_key(&wire).expect("nonce len");
        let mut body = plaintext.to_vec();
        session_cipher(key)
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut body)
            .expect("chacha seal");
        wire.extend_from_slice(&body);
        wire
    }

    /// Open a sealed payload. Truncation, tampering and key mismatch all
    /// yield [`Error::Crypto`]; the caller drops the packet.
    pub fn open_prefixed(key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>, Error> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto);
        }
        let (prefix, body) = wire.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(prefix).map_err(|_| Error::Crypto)?;
        let mut buf = body.to_vec();
        let opened = session_cipher(key)
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| Error::Crypto)?;
        Ok(opened.to_vec())
    }
}

pub mod kdf {
    //! The derivation step between ECDH agreement and a usable session key.

    use ring::hkdf::{Salt, HKDF_SHA256};

    /// Condense ECDH output into a 32-byte symmetric session key via
    /// HKDF-SHA256 with neither salt nor info.
    pub fn session_key(ikm: &[u8]) -> [u8; 32] {
        let prk = Salt::new(HKDF_SHA256, &[]).extract(ikm);
        let okm = prk.expand(&[], HKDF_SHA256).expect("hkdf expand");
        let mut key = [0u8; 32];
        okm.fill(&mut key).expect("hkdf fill");
        key
    }
}

pub mod ecdh {
    //! P-256 identity keypairs and session-key agreement.
    //!
    //! Public keys travel as base64-wrapped PEM SubjectPublicKeyInfo. The
    //! agreed secret is run through [`crate::kdf::session_key`] to yield the
    //! 32-byte symmetric key both sides converge on.

    use crate::{kdf, Error};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use p256::ecdh::diffie_hellman;
    use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
    use p256::SecretKey;
    pub use p256::PublicKey;

    pub struct KeyPair {
        secret: SecretKey,
        public_pem: String,
    }

    impl KeyPair {
        pub fn generate() -> Self {
            let secret = SecretKey::random(&mut rand_core::OsRng);
            let public_pem = secret
                .public_key()
                .to_public_key_pem(LineEnding::LF)
                .expect("spki encode");
            Self { secret, public_pem }
        }

        /// PEM-encoded SubjectPublicKeyInfo of this identity.
        pub fn public_key_pem(&self) -> &str {
            &self.public_pem
        }

        /// Wire form of the public key: base64 over the PEM bytes.
        pub fn public_key_b64(&self) -> String {
            BASE64.encode(self.public_pem.as_bytes())
        }

        /// ECDH with a peer public key, then HKDF to a 32-byte session key.
        pub fn agree(&self, peer: &PublicKey) -> [u8; 32] {
            let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
            kdf::session_key(shared.raw_secret_bytes().as_slice())
        }
    }

    /// Decode a base64-wrapped PEM SubjectPublicKeyInfo into a P-256 key.
    pub fn public_key_from_b64(b64: &str) -> Result<PublicKey, Error> {
        let pem_bytes = BASE64.decode(b64.trim()).map_err(|_| Error::BadKey)?;
        let pem = std::str::from_utf8(&pem_bytes).map_err(|_| Error::BadKey)?;
        PublicKey::from_public_key_pem(pem).map_err(|_| Error::BadKey)
    }
}
