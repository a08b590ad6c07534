//! Per-field envelope encryption for stored messages.
//!
//! Every field is sealed under its own key, derived from the master secret
//! and a fresh salt; the salt and nonce travel with the ciphertext as
//! separate attributes. Sealing a message also emits the keyed search index
//! over `subject + " " + body` (see [`crate::index`]).

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::{Bytes, IfIsHumanReadable, serde_as};
use thiserror::Error;

use crate::aead::{AeadError, KEY_LEN, NONCE_LEN};
use crate::index;
use crate::kdf::{FIELD_KEY_ITERATIONS, SALT_LEN, derive_key, random_nonce, random_salt};
use crate::redacted_debug;
use crate::wipe::wipe;

/// Algorithm tag written into every sealed record.
pub const ALGORITHM: &str = "chacha20poly1305";

/// Key version written into newly sealed records. Records sealed under an
/// older master keep the version they were sealed with.
pub const KEY_VERSION: u32 = 1;

/// Errors returned by sealing and opening operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("encryption failed")]
    Encrypt,
    /// The AEAD tag did not verify for one of the fields.
    #[error("authentication failed")]
    Auth,
    #[error("record failed validation: {0}")]
    Validation(&'static str),
    #[error("master key must be {KEY_LEN} bytes")]
    KeyLength,
}

impl From<AeadError> for SealError {
    fn from(err: AeadError) -> Self {
        match err {
            AeadError::Encrypt => SealError::Encrypt,
            AeadError::Auth => SealError::Auth,
        }
    }
}

/// One encrypted field: ciphertext plus the salt and nonce it was sealed
/// under.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedField {
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub ciphertext: Vec<u8>,
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub salt: [u8; SALT_LEN],
    #[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")]
    pub nonce: [u8; NONCE_LEN],
}

impl SealedField {
    /// Rebuild a sealed field from raw storage columns, checking lengths.
    pub fn from_parts(ciphertext: Vec<u8>, salt: &[u8], nonce: &[u8]) -> Result<Self, SealError> {
        if ciphertext.is_empty() {
            return Err(SealError::Validation("empty ciphertext"));
        }
        let salt: [u8; SALT_LEN] = salt
            .try_into()
            .map_err(|_| SealError::Validation("salt length"))?;
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| SealError::Validation("nonce length"))?;
        Ok(Self { ciphertext, salt, nonce })
    }
}

/// The three sealed fields of one message plus its search index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedMessage {
    pub subject: SealedField,
    pub body: SealedField,
    pub headers: SealedField,
    pub search_index: String,
    pub algorithm: String,
    pub key_version: u32,
}

impl SealedMessage {
    /// Check that the record is self-consistent: fields present, algorithm
    /// tag and key version recognized. Unknown values are a hard failure,
    /// never a silent downgrade.
    pub fn validate(&self) -> Result<(), SealError> {
        if self.algorithm != ALGORITHM {
            return Err(SealError::Validation("unknown algorithm tag"));
        }
        if self.key_version == 0 || self.key_version > KEY_VERSION {
            return Err(SealError::Validation("unknown key version"));
        }
        for field in [&self.subject, &self.body, &self.headers] {
            if field.ciphertext.is_empty() {
                return Err(SealError::Validation("empty ciphertext"));
            }
        }
        Ok(())
    }
}

/// Decrypted view of a sealed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenMessage {
    pub subject: String,
    pub body: String,
    pub headers: String,
}

/// Holds the master key and seals/opens message fields.
///
/// The master key lives in a single owned buffer; rotation wipes it in place
/// before installing the replacement. It is never formatted into logs.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Sealer {
    #[derivative(Debug(format_with = "redacted_debug"))]
    master: [u8; KEY_LEN],
    #[derivative(Debug(format_with = "redacted_debug"))]
    index_key: [u8; KEY_LEN],
}

impl Sealer {
    pub fn new(master: [u8; KEY_LEN]) -> Self {
        let index_key = index::index_key(&master);
        Self { master, index_key }
    }

    /// Seal one field under a fresh salt and nonce.
    pub fn seal_field(&self, plaintext: &[u8]) -> Result<SealedField, SealError> {
        let salt = random_salt();
        let nonce = random_nonce();
        let key = derive_key(&self.master, &salt, FIELD_KEY_ITERATIONS);
        let ciphertext = key.encrypt(nonce, plaintext)?;
        Ok(SealedField { ciphertext, salt, nonce })
    }

    /// Open one field, verifying the tag.
    pub fn open_field(&self, field: &SealedField) -> Result<Vec<u8>, SealError> {
        let key = derive_key(&self.master, &field.salt, FIELD_KEY_ITERATIONS);
        Ok(key.decrypt(field.nonce, &field.ciphertext)?)
    }

    /// Seal a message: subject, body, and serialized headers each under
    /// their own salt and nonce, plus the search index over
    /// `subject + " " + body`.
    pub fn seal_message(
        &self,
        subject: &str,
        body: &str,
        headers: &str,
    ) -> Result<SealedMessage, SealError> {
        let indexed = format!("{subject} {body}");
        Ok(SealedMessage {
            subject: self.seal_field(subject.as_bytes())?,
            body: self.seal_field(body.as_bytes())?,
            headers: self.seal_field(headers.as_bytes())?,
            search_index: index::build_index(&self.index_key, &indexed),
            algorithm: ALGORITHM.to_string(),
            key_version: KEY_VERSION,
        })
    }

    /// Validate and open a sealed message.
    pub fn open_message(&self, sealed: &SealedMessage) -> Result<OpenMessage, SealError> {
        sealed.validate()?;
        let subject = self.open_field(&sealed.subject)?;
        let body = self.open_field(&sealed.body)?;
        let headers = self.open_field(&sealed.headers)?;
        Ok(OpenMessage {
            subject: String::from_utf8(subject)
                .map_err(|_| SealError::Validation("subject is not utf-8"))?,
            body: String::from_utf8(body).map_err(|_| SealError::Validation("body is not utf-8"))?,
            headers: String::from_utf8(headers)
                .map_err(|_| SealError::Validation("headers are not utf-8"))?,
        })
    }

    /// Answer a search query against a stored index.
    pub fn search(&self, stored_index: &str, query: &str) -> bool {
        index::matches(&self.index_key, stored_index, query)
    }

    /// Install a new master key, wiping the old one in place first.
    /// Already-sealed records keep their `key_version`; re-sealing them is a
    /// separate batch operation.
    pub fn rotate(&mut self, new_master: &[u8]) -> Result<(), SealError> {
        let new_master: [u8; KEY_LEN] = new_master.try_into().map_err(|_| SealError::KeyLength)?;
        wipe(&mut self.master);
        wipe(&mut self.index_key);
        self.master = new_master;
        self.index_key = index::index_key(&self.master);
        Ok(())
    }
}

impl Drop for Sealer {
    fn drop(&mut self) {
        wipe(&mut self.master);
        wipe(&mut self.index_key);
    }
}
