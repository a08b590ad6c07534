//! Cryptographic core for pelican: authenticated symmetric encryption,
//! password-based key derivation, constant-time verification, per-field
//! envelope sealing, and the keyed search index over sealed text.

pub mod aead;
pub mod index;
pub mod kdf;
pub mod password;
pub mod seal;
pub mod wipe;

fn redacted_debug<T>(_value: &T, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    formatter.write_str("REDACTED")
}

/// Compare two byte strings in constant time.
///
/// Short-circuits only on a length mismatch; for equal lengths the running
/// time does not depend on where the contents differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
