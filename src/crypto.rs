//! Key derivation and per-block authenticated encryption

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::SixcyError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Argon2id memory cost: 64 MiB
pub const KDF_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id passes
pub const KDF_ITERATIONS: u32 = 3;
/// Argon2id lanes
pub const KDF_PARALLELISM: u32 = 1;

/// Derive the archive key from a password.
///
/// The salt is the archive uuid, so the same password yields a different key
/// on every archive.
pub fn derive_key(password: &str, salt: &[u8; 16]) -> Result<[u8; KEY_LEN], SixcyError> {
    let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_PARALLELISM, Some(KEY_LEN))
        .map_err(|_| SixcyError::KdfFailed)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|_| SixcyError::KdfFailed)?;
    Ok(key)
}

/// AES-256-GCM sealer/opener for block payloads.
///
/// Sealed payloads are laid out as `nonce(12) || ciphertext || tag(16)`, with
/// a fresh nonce from the OS entropy pool per block.
pub(crate) struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
    }

    pub fn from_password(password: &str, salt: &[u8; 16]) -> Result<Self, SixcyError> {
        Ok(Self::new(&derive_key(password, salt)?))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SixcyError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SixcyError::OutOfRange("plaintext too large for aes-gcm"))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, SixcyError> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(SixcyError::Truncated {
                declared: (NONCE_LEN + TAG_LEN) as u64,
                available: payload.len() as u64,
            });
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SixcyError::AuthFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_salt() {
        let a = derive_key("my passphrase", &[0x11; 16]).unwrap();
        let b = derive_key("my passphrase", &[0x22; 16]).unwrap();
        let a2 = derive_key("my passphrase", &[0x11; 16]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
    }

    #[test]
    fn seal_open_roundtrip() {
        let cipher = BlockCipher::new(&[0x42; KEY_LEN]);
        let payload = cipher.seal(b"block bytes").unwrap();
        assert_eq!(payload.len(), NONCE_LEN + b"block bytes".len() + TAG_LEN);
        assert_eq!(cipher.open(&payload).unwrap(), b"block bytes");
    }

    #[test]
    fn tamper_fails_auth() {
        let cipher = BlockCipher::new(&[0x42; KEY_LEN]);
        let mut payload = cipher.seal(b"block bytes").unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        assert!(matches!(cipher.open(&payload), Err(SixcyError::AuthFailed)));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let cipher = BlockCipher::new(&[0x42; KEY_LEN]);
        let payload = cipher.seal(b"block bytes").unwrap();
        let other = BlockCipher::new(&[0x43; KEY_LEN]);
        assert!(matches!(other.open(&payload), Err(SixcyError::AuthFailed)));
    }
}
