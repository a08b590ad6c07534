//! The credential service: user lifecycle, password verification with
//! lockout, the TOTP second factor, and bearer-token issue/refresh/revoke.
//!
//! Every failure maps to exactly one [`Fault`]; partial credentials are
//! never returned. The audit trail is the tracing log; user-facing messages
//! go through [`Fault::public_message`].

use sqlx::SqlitePool;
use pelican_crypt::kdf::random_salt;
use pelican_crypt::password::{hash_password, verify_password};
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

use crate::store::sessions::{self, SessionRecord};
use crate::store::users::{self, UserRecord};
use crate::tokens::{Claims, IssuedPair, TokenKind, TokenSigner};
use crate::totp;

/// Consecutive failures that trigger a lockout.
pub const MAX_FAILED_ATTEMPTS: u32 = 5;

/// How long a lockout lasts.
pub const LOCKOUT_SECS: u64 = 30 * 60;

/// Verified against when the user is unknown, so the reply takes as long as
/// a real mismatch.
const DUMMY_SALT: [u8; 16] = [0x5a; 16];

/// Result of a successful login or refresh.
#[derive(Clone, Debug, serde::Serialize)]
pub struct LoginTokens {
    pub access: String,
    pub refresh: String,
    pub expires_in: u64,
    pub is_admin: bool,
}

/// Password policy: at least 8 characters and three of {lowercase,
/// uppercase, digit, punctuation}.
pub fn password_is_strong(password: &str) -> bool {
    if password.chars().count() < 8 {
        return false;
    }
    let classes = [
        password.chars().any(|c| c.is_ascii_lowercase()),
        password.chars().any(|c| c.is_ascii_uppercase()),
        password.chars().any(|c| c.is_ascii_digit()),
        password.chars().any(|c| c.is_ascii_punctuation()),
    ];
    classes.iter().filter(|present| **present).count() >= 3
}

pub struct CredentialService {
    db: SqlitePool,
    signer: TokenSigner,
}

impl CredentialService {
    pub fn new(db: SqlitePool, signer: TokenSigner) -> Self {
        Self { db, signer }
    }

    pub async fn create_user(
        &self,
        email: &EmailAddress,
        password: &str,
        is_admin: bool,
    ) -> Result<(), Fault> {
        if !password_is_strong(password) {
            return Err(Fault::WeakPassword);
        }
        let salt = random_salt();
        let user = UserRecord {
            email: email.clone(),
            password_hash: hash_password(password, &salt).to_vec(),
            salt: salt.to_vec(),
            is_admin,
            totp_secret: None,
            totp_enabled: false,
            failed_attempts: 0,
            locked_until: None,
            created_at: Timestamp::now(),
            last_login: None,
        };
        users::insert_user(&self.db, &user).await?;
        tracing::info!(user = %email, is_admin, "user created");
        Ok(())
    }

    pub async fn delete_user(&self, email: &EmailAddress) -> Result<(), Fault> {
        users::delete_user(&self.db, email).await?;
        tracing::info!(user = %email, "user deleted, sessions cascaded");
        Ok(())
    }

    /// Password check with the lockout counter. Success resets the counter
    /// and stamps the login time.
    pub async fn authenticate(
        &self,
        email: &EmailAddress,
        password: &str,
    ) -> Result<UserRecord, Fault> {
        let Some(user) = users::load_user(&self.db, email).await? else {
            // Burn the same hashing work as a real mismatch.
            let _ = verify_password(password, &DUMMY_SALT, &[0u8; 32]);
            tracing::warn!(user = %email, "authentication failed: unknown user");
            return Err(Fault::UnknownUser);
        };
        if let Some(locked_until) = user.locked_until
            && !locked_until.is_past()
        {
            tracing::warn!(user = %email, until = locked_until.0, "authentication rejected: locked");
            return Err(Fault::Locked);
        }
        if !verify_password(password, &user.salt, &user.password_hash) {
            let failed = user.failed_attempts + 1;
            let locked_until = (failed >= MAX_FAILED_ATTEMPTS)
                .then(|| Timestamp::now().plus_secs(LOCKOUT_SECS));
            users::record_failure(&self.db, email, failed, locked_until).await?;
            if locked_until.is_some() {
                tracing::warn!(user = %email, failed, "authentication failed: account locked");
            } else {
                tracing::warn!(user = %email, failed, "authentication failed: wrong password");
            }
            return Err(Fault::InvalidCredentials);
        }
        users::record_success(&self.db, email, Timestamp::now()).await?;
        Ok(UserRecord {
            failed_attempts: 0,
            locked_until: None,
            last_login: Some(Timestamp::now()),
            ..user
        })
    }

    /// The combined happy path: password, then the second factor when
    /// enrolled, then a token pair.
    pub async fn login(
        &self,
        email: &EmailAddress,
        password: &str,
        totp_code: Option<&str>,
    ) -> Result<LoginTokens, Fault> {
        let user = self.authenticate(email, password).await?;
        if user.totp_enabled {
            let code = totp_code.ok_or(Fault::TotpRequired)?;
            let secret = user
                .totp_secret
                .as_deref()
                .ok_or_else(|| Fault::ValidationFailed("totp enabled without secret".into()))?;
            if !totp::verify_code(secret, code, Timestamp::now().0)? {
                tracing::warn!(user = %email, "authentication failed: bad one-time code");
                return Err(Fault::InvalidTotp);
            }
        }
        self.issue_for(&user).await
    }

    async fn issue_for(&self, user: &UserRecord) -> Result<LoginTokens, Fault> {
        let pair = self.signer.issue(&user.email, user.is_admin);
        self.persist_session(&pair.access_claims).await?;
        self.persist_session(&pair.refresh_claims).await?;
        tracing::debug!(user = %user.email, "token pair issued");
        Ok(LoginTokens {
            access: pair.access,
            refresh: pair.refresh,
            expires_in: pair.expires_in,
            is_admin: user.is_admin,
        })
    }

    async fn persist_session(&self, claims: &Claims) -> Result<(), Fault> {
        sessions::insert_session(
            &self.db,
            &SessionRecord {
                token_id: claims.jti.clone(),
                subject_email: claims.sub.clone(),
                is_admin: claims.admin,
                issued_at: Timestamp(claims.iat),
                expires_at: Timestamp(claims.exp),
                kind: claims.kind.as_str().to_string(),
            },
        )
        .await
    }

    /// Full verification: signature, expiry, blacklist.
    pub async fn verify(&self, token: &str) -> Result<Claims, Fault> {
        let claims = self.signer.decode(token)?;
        if sessions::is_blacklisted(&self.db, &claims.jti).await? {
            tracing::warn!(user = %claims.sub, "rejected revoked token");
            return Err(Fault::TokenRevoked);
        }
        Ok(claims)
    }

    /// Trade a valid refresh token for a new pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<LoginTokens, Fault> {
        let claims = self.verify(refresh_token).await?;
        if claims.kind != TokenKind::Refresh {
            return Err(Fault::InvalidCredentials);
        }
        let user = users::load_user(&self.db, &claims.sub)
            .await?
            .ok_or(Fault::UnknownUser)?;
        self.issue_for(&user).await
    }

    /// Blacklist a token until its natural expiry. Revoking an
    /// already-expired token is a no-op.
    pub async fn revoke(&self, token: &str) -> Result<(), Fault> {
        let claims = match self.signer.decode(token) {
            Ok(claims) => claims,
            Err(Fault::TokenExpired) => return Ok(()),
            Err(err) => return Err(err),
        };
        sessions::blacklist_token(&self.db, &claims.jti, Timestamp(claims.exp)).await?;
        tracing::warn!(user = %claims.sub, kind = claims.kind.as_str(), "token revoked");
        Ok(())
    }

    /// Enrol the second factor; returns the base32 secret for the
    /// authenticator app.
    pub async fn enable_totp(&self, email: &EmailAddress) -> Result<String, Fault> {
        let user = users::load_user(&self.db, email).await?.ok_or(Fault::UnknownUser)?;
        let secret = totp::generate_secret();
        users::set_totp(&self.db, &user.email, Some(&secret), true).await?;
        tracing::info!(user = %email, "totp enabled");
        Ok(secret)
    }

    /// Drop the second factor and clear the secret.
    pub async fn disable_totp(&self, email: &EmailAddress) -> Result<(), Fault> {
        let user = users::load_user(&self.db, email).await?.ok_or(Fault::UnknownUser)?;
        users::set_totp(&self.db, &user.email, None, false).await?;
        tracing::info!(user = %email, "totp disabled");
        Ok(())
    }

    /// Check a code for an enrolled user at the current time step.
    pub async fn verify_totp(&self, email: &EmailAddress, code: &str) -> Result<(), Fault> {
        let user = users::load_user(&self.db, email).await?.ok_or(Fault::UnknownUser)?;
        let secret = user
            .totp_secret
            .as_deref()
            .filter(|_| user.totp_enabled)
            .ok_or_else(|| Fault::ValidationFailed("totp is not enabled".into()))?;
        if !totp::verify_code(secret, code, Timestamp::now().0)? {
            return Err(Fault::InvalidTotp);
        }
        Ok(())
    }

    /// Periodic sweeps: expired sessions out, stale blacklist entries out.
    pub async fn sweep_expired(&self) -> Result<(), Fault> {
        let now = Timestamp::now();
        let sessions_removed = sessions::purge_expired(&self.db, now).await?;
        let blacklist_removed = sessions::purge_blacklist(&self.db, now).await?;
        if sessions_removed > 0 || blacklist_removed > 0 {
            tracing::debug!(sessions_removed, blacklist_removed, "credential sweep");
        }
        Ok(())
    }
}
