use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use crate::aead::{AeadKey, KEY_LEN, NONCE_LEN};

/// Length of a key-derivation salt in bytes.
pub const SALT_LEN: usize = 16;

/// Iteration count for per-field key derivation. Field keys are derived on
/// every seal and open, so this is lower than [`crate::password::ITERATIONS`].
pub const FIELD_KEY_ITERATIONS: u32 = 4_096;

/// Derive a 32-byte symmetric key from a master secret and a salt with
/// PBKDF2-HMAC-SHA256.
pub fn derive_key(master: &[u8], salt: &[u8; SALT_LEN], iterations: u32) -> AeadKey {
    let bytes = pbkdf2_hmac_array::<Sha256, KEY_LEN>(master, salt, iterations);
    AeadKey::from_bytes(bytes)
}

/// Draw `n` random bytes from the OS RNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Draw a fresh random salt.
pub fn random_salt() -> [u8; SALT_LEN] {
    rand::random()
}

/// Draw a fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_derive_same_key() {
        let salt = [7u8; SALT_LEN];
        let a = derive_key(b"master", &salt, FIELD_KEY_ITERATIONS);
        let b = derive_key(b"master", &salt, FIELD_KEY_ITERATIONS);
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn different_salts_derive_different_keys() {
        let a = derive_key(b"master", &[1u8; SALT_LEN], FIELD_KEY_ITERATIONS);
        let b = derive_key(b"master", &[2u8; SALT_LEN], FIELD_KEY_ITERATIONS);
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn random_bytes_length() {
        assert_eq!(random_bytes(20).len(), 20);
    }
}
