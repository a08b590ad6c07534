use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_with::base64::{Base64, UrlSafe};
use serde_with::formats::Unpadded;
use serde_with::{Bytes, IfIsHumanReadable, serde_as};
use thiserror::Error;

use crate::redacted_debug;
use crate::wipe::wipe;

/// Length of an AEAD nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Length of a symmetric key in bytes.
pub const KEY_LEN: usize = 32;

/// Errors returned by symmetric encryption operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    #[error("encryption failed")]
    Encrypt,
    /// The authentication tag did not verify: the ciphertext, nonce, or key
    /// is wrong or was tampered with.
    #[error("authentication failed")]
    Auth,
}

/// ChaCha20-Poly1305 key used for symmetric encryption and decryption.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Debug)]
pub struct AeadKey(
    #[derivative(Debug(format_with = "redacted_debug"))]
    #[serde_as(as = "IfIsHumanReadable<Base64<UrlSafe, Unpadded>, Bytes>")] [u8; KEY_LEN],
);

impl AeadKey {
    /// Generate a random symmetric key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a symmetric key from 32 raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Serialize the symmetric key as 32 bytes.
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0
    }

    /// Encrypt `plaintext` under the given nonce. The returned ciphertext
    /// carries the Poly1305 tag.
    pub fn encrypt(&self, nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| AeadError::Encrypt)
    }

    /// Decrypt `ciphertext` under the given nonce, verifying the tag.
    pub fn decrypt(&self, nonce: [u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, AeadError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| AeadError::Auth)
    }
}

impl Drop for AeadKey {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}
