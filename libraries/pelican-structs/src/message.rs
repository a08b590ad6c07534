use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::{Bytes, IfIsHumanReadable, serde_as};
use thiserror::Error;
use pelican_crypt::seal::SealedMessage;

use crate::address::EmailAddress;
use crate::header::Header;
use crate::timestamp::{NanoTimestamp, Timestamp};

/// Identifier of one stored message, unique within its mailbox.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct MessageId(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] [u8; 16]);

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid message id")]
pub struct MessageIdError;

impl MessageId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for MessageId {
    type Err = MessageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| MessageIdError)?;
        let buf: [u8; 16] = bytes.try_into().map_err(|_| MessageIdError)?;
        Ok(Self(buf))
    }
}

/// A delivered message as handed to the inbound acceptor: normalized
/// addresses and a single UTF-8 body part. MIME parsing happens upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: EmailAddress,
    pub recipient: EmailAddress,
    pub subject: String,
    pub body: String,
    pub headers: Vec<Header>,
}

/// One encrypted message record as persisted. Immutable once stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub mailbox: EmailAddress,
    pub sender: EmailAddress,
    pub recipient: EmailAddress,
    pub received_at: NanoTimestamp,
    pub sealed: SealedMessage,
    pub encrypted_at: Timestamp,
}

/// Decrypted header line for a mailbox listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: MessageId,
    pub sender: EmailAddress,
    pub subject: String,
    pub received_at: NanoTimestamp,
}

/// Fully decrypted message, as returned by a fetch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenedMessage {
    pub id: MessageId,
    pub mailbox: EmailAddress,
    pub sender: EmailAddress,
    pub recipient: EmailAddress,
    pub received_at: NanoTimestamp,
    pub subject: String,
    pub body: String,
    pub headers: Vec<Header>,
}
