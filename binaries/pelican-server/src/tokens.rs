//! Signed bearer tokens: a base64url JSON claims segment plus a keyed
//! BLAKE3 tag over it, verified in constant time. Revocation lives in the
//! blacklist table and is checked by the credential service.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Deserialize, Serialize};
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

const SIGNING_KEY_CONTEXT: &str = "pelican-server 2026-06 token signing key";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// What a token asserts about its bearer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: EmailAddress,
    pub admin: bool,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
    pub kind: TokenKind,
}

/// An access/refresh pair as handed to the client.
#[derive(Clone, Debug)]
pub struct IssuedPair {
    pub access: String,
    pub refresh: String,
    pub expires_in: u64,
    pub access_claims: Claims,
    pub refresh_claims: Claims,
}

pub struct TokenSigner {
    key: [u8; 32],
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl TokenSigner {
    pub fn new(secret: &str, access_ttl_secs: u64, refresh_ttl_secs: u64) -> Self {
        Self {
            key: blake3::derive_key(SIGNING_KEY_CONTEXT, secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    fn claims(&self, subject: &EmailAddress, admin: bool, kind: TokenKind, now: Timestamp) -> Claims {
        let ttl = match kind {
            TokenKind::Access => self.access_ttl_secs,
            TokenKind::Refresh => self.refresh_ttl_secs,
        };
        Claims {
            sub: subject.clone(),
            admin,
            iat: now.0,
            exp: now.plus_secs(ttl).0,
            jti: hex::encode(rand::random::<[u8; 16]>()),
            kind,
        }
    }

    pub(crate) fn sign(&self, claims: &Claims) -> String {
        let payload = B64.encode(serde_json::to_vec(claims).expect("claims serialization failed"));
        let tag = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!("{payload}.{}", B64.encode(tag.as_bytes()))
    }

    /// Issue a fresh access/refresh pair for a subject.
    pub fn issue(&self, subject: &EmailAddress, admin: bool) -> IssuedPair {
        let now = Timestamp::now();
        let access_claims = self.claims(subject, admin, TokenKind::Access, now);
        let refresh_claims = self.claims(subject, admin, TokenKind::Refresh, now);
        IssuedPair {
            access: self.sign(&access_claims),
            refresh: self.sign(&refresh_claims),
            expires_in: self.access_ttl_secs,
            access_claims,
            refresh_claims,
        }
    }

    /// Check signature and expiry; the blacklist is the caller's concern.
    pub fn decode(&self, token: &str) -> Result<Claims, Fault> {
        let (payload, tag) = token.split_once('.').ok_or(Fault::InvalidCredentials)?;
        let tag = B64.decode(tag).map_err(|_| Fault::InvalidCredentials)?;
        let expected = blake3::keyed_hash(&self.key, payload.as_bytes());
        if !pelican_crypt::constant_time_eq(expected.as_bytes(), &tag) {
            return Err(Fault::InvalidCredentials);
        }
        let payload = B64.decode(payload).map_err(|_| Fault::InvalidCredentials)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| Fault::InvalidCredentials)?;
        if Timestamp(claims.exp).is_past() {
            return Err(Fault::TokenExpired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test signing secret", 900, 86_400)
    }

    fn subject() -> EmailAddress {
        EmailAddress::parse("u@d.test").expect("addr")
    }

    #[test]
    fn issued_tokens_decode_to_their_claims() {
        let signer = signer();
        let pair = signer.issue(&subject(), true);
        let access = signer.decode(&pair.access).expect("decode access");
        let refresh = signer.decode(&pair.refresh).expect("decode refresh");
        assert_eq!(access, pair.access_claims);
        assert_eq!(refresh, pair.refresh_claims);
        assert_eq!(access.kind, TokenKind::Access);
        assert_eq!(refresh.kind, TokenKind::Refresh);
        assert!(access.admin);
        assert_eq!(pair.expires_in, 900);
    }

    #[test]
    fn access_and_refresh_have_distinct_ids() {
        let pair = signer().issue(&subject(), false);
        assert_ne!(pair.access_claims.jti, pair.refresh_claims.jti);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = signer();
        let pair = signer.issue(&subject(), false);
        let (payload, tag) = pair.access.split_once('.').expect("split");
        let mut bytes = B64.decode(payload).expect("decode");
        // Flip the admin flag inside the claims JSON.
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        bytes = text.replace("\"admin\":false", "\"admin\":true").into_bytes();
        let forged = format!("{}.{tag}", B64.encode(bytes));
        assert_eq!(signer.decode(&forged), Err(Fault::InvalidCredentials));
    }

    #[test]
    fn foreign_signer_is_rejected() {
        let pair = signer().issue(&subject(), false);
        let other = TokenSigner::new("different secret", 900, 86_400);
        assert_eq!(other.decode(&pair.access), Err(Fault::InvalidCredentials));
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = signer();
        let claims = Claims {
            sub: subject(),
            admin: false,
            iat: 0,
            exp: 1,
            jti: "0".repeat(32),
            kind: TokenKind::Access,
        };
        let token = signer.sign(&claims);
        assert_eq!(signer.decode(&token), Err(Fault::TokenExpired));
    }

    #[test]
    fn garbage_is_invalid_credentials() {
        assert_eq!(signer().decode("not-a-token"), Err(Fault::InvalidCredentials));
        assert_eq!(signer().decode("a.b.c"), Err(Fault::InvalidCredentials));
    }
}
