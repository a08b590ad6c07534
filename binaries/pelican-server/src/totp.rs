//! Time-based one-time passwords (RFC 6238): HMAC-SHA1, six digits, 30 s
//! step, one step of clock skew in either direction.

use totp_rs::{Algorithm, Secret, TOTP};
use pelican_crypt::kdf::random_bytes;
use pelican_structs::fault::Fault;

/// Secret length in raw bytes, before base32 encoding.
pub const SECRET_LEN: usize = 20;

const DIGITS: usize = 6;
const STEP: u64 = 30;
const SKEW: u8 = 1;

/// Generate a fresh base32-encoded secret.
pub fn generate_secret() -> String {
    Secret::Raw(random_bytes(SECRET_LEN)).to_encoded().to_string()
}

fn totp_for(secret: &str) -> Result<TOTP, Fault> {
    let bytes = Secret::Encoded(secret.to_string())
        .to_bytes()
        .map_err(|_| Fault::ValidationFailed("malformed totp secret".into()))?;
    TOTP::new(Algorithm::SHA1, DIGITS, SKEW, STEP, bytes)
        .map_err(|_| Fault::ValidationFailed("malformed totp secret".into()))
}

/// Check a code against the secret at the given Unix time. Steps
/// `{t-1, t, t+1}` are accepted.
pub fn verify_code(secret: &str, code: &str, time: u64) -> Result<bool, Fault> {
    Ok(totp_for(secret)?.check(code, time))
}

/// The code the secret produces at the given Unix time. Used by enrolment
/// displays and tests.
pub fn code_at(secret: &str, time: u64) -> Result<String, Fault> {
    Ok(totp_for(secret)?.generate(time))
}
