use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use crate::constant_time_eq;

/// Length of a password hash in bytes.
pub const HASH_LEN: usize = 32;

/// Iteration count for password hashing. Passwords are verified a handful of
/// times per session, so this is much higher than field-key derivation.
pub const ITERATIONS: u32 = 210_000;

/// Hash a password with the given salt using PBKDF2-HMAC-SHA256.
///
/// Deterministic: the same password and salt always produce the same hash.
pub fn hash_password(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    hash_password_with(password, salt, ITERATIONS)
}

/// Hash a password with an explicit iteration count.
pub fn hash_password_with(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    pbkdf2_hmac_array::<Sha256, HASH_LEN>(password.as_bytes(), salt, iterations)
}

/// Verify a password against a stored hash.
///
/// Recomputes the hash and compares in constant time; the comparison
/// short-circuits only on a length mismatch.
pub fn verify_password(password: &str, salt: &[u8], stored: &[u8]) -> bool {
    let computed = hash_password(password, salt);
    constant_time_eq(&computed, stored)
}
