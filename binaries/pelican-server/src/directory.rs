//! The mailbox directory: delivery destinations with their own IMAP/SMTP
//! credentials (independent of user credentials) and per-mailbox forwarding
//! rules.

use moka::future::Cache;
use sqlx::SqlitePool;
use pelican_crypt::kdf::random_salt;
use pelican_crypt::password::{hash_password, verify_password};
use pelican_structs::address::{EmailAddress, MailboxName};
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

use crate::store::mailboxes::{self, MailboxRecord};

pub struct MailboxDirectory {
    db: SqlitePool,
    cache: Cache<String, MailboxRecord>,
}

impl MailboxDirectory {
    /// The cache handle comes from [`crate::backends::Backends`], which
    /// also supervises it.
    pub fn new(db: SqlitePool, cache: Cache<String, MailboxRecord>) -> Self {
        Self { db, cache }
    }

    pub async fn create_mailbox(
        &self,
        email: &EmailAddress,
        password: &str,
        description: &str,
        owner: &EmailAddress,
    ) -> Result<(), Fault> {
        MailboxName::parse(email.local_part())
            .map_err(|err| Fault::ValidationFailed(err.to_string()))?;
        let salt = random_salt();
        let mailbox = MailboxRecord {
            email: email.clone(),
            password_hash: hash_password(password, &salt).to_vec(),
            salt: salt.to_vec(),
            description: description.to_string(),
            owner: owner.clone(),
            active: true,
            forward_to: None,
            forward_enabled: false,
            keep_original: true,
            created_at: Timestamp::now(),
        };
        mailboxes::insert_mailbox(&self.db, &mailbox).await?;
        tracing::info!(mailbox = %email, owner = %owner, "mailbox created");
        Ok(())
    }

    pub async fn delete_mailbox(&self, email: &EmailAddress) -> Result<(), Fault> {
        if !mailboxes::delete_mailbox(&self.db, email).await? {
            return Err(Fault::UnknownRecipient);
        }
        self.cache.invalidate(email.as_str()).await;
        tracing::info!(mailbox = %email, "mailbox deleted");
        Ok(())
    }

    /// Cached read path for the acceptor; writes below invalidate.
    pub async fn lookup(&self, email: &EmailAddress) -> Result<Option<MailboxRecord>, Fault> {
        if let Some(hit) = self.cache.get(email.as_str()).await {
            return Ok(Some(hit));
        }
        let loaded = mailboxes::load_mailbox(&self.db, email).await?;
        if let Some(mailbox) = &loaded {
            self.cache
                .insert(email.as_str().to_string(), mailbox.clone())
                .await;
        }
        Ok(loaded)
    }

    /// Mailbox login for the delivery paths. Inactive and unknown mailboxes
    /// fail the same way as a wrong password; the cause goes to the log.
    pub async fn validate_mailbox(
        &self,
        email: &EmailAddress,
        password: &str,
    ) -> Result<(), Fault> {
        let Some(mailbox) = mailboxes::load_mailbox(&self.db, email).await? else {
            tracing::warn!(mailbox = %email, "mailbox login failed: unknown mailbox");
            return Err(Fault::InvalidCredentials);
        };
        if !mailbox.active {
            tracing::warn!(mailbox = %email, "mailbox login failed: inactive");
            return Err(Fault::InvalidCredentials);
        }
        if !verify_password(password, &mailbox.salt, &mailbox.password_hash) {
            tracing::warn!(mailbox = %email, "mailbox login failed: wrong password");
            return Err(Fault::InvalidCredentials);
        }
        Ok(())
    }

    /// Write the forwarding rule. An enabled rule needs a nonempty target;
    /// `keep_original` decides whether delivered mail is also stored
    /// locally.
    pub async fn update_forwarding(
        &self,
        email: &EmailAddress,
        forward_to: Option<&EmailAddress>,
        enabled: bool,
        keep_original: bool,
    ) -> Result<(), Fault> {
        if enabled && forward_to.is_none() {
            return Err(Fault::ValidationFailed(
                "forwarding enabled without a target".into(),
            ));
        }
        if !mailboxes::update_forwarding(&self.db, email, forward_to, enabled, keep_original)
            .await?
        {
            return Err(Fault::UnknownRecipient);
        }
        self.cache.invalidate(email.as_str()).await;
        tracing::info!(
            mailbox = %email,
            enabled,
            keep_original,
            target = forward_to.map(|a| a.as_str().to_string()).unwrap_or_default(),
            "forwarding rule updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::memory_pool;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).expect("addr")
    }

    async fn directory() -> MailboxDirectory {
        MailboxDirectory::new(memory_pool().await, Cache::builder().build())
    }

    #[tokio::test]
    async fn create_validates_local_part_grammar() {
        let directory = directory().await;
        let owner = addr("owner@d.test");
        let err = directory
            .create_mailbox(&addr("ab@d.test"), "Mailbox.Pass1", "", &owner)
            .await
            .expect_err("too short");
        assert!(matches!(err, Fault::ValidationFailed(_)));

        directory
            .create_mailbox(&addr("a.b@d.test"), "Mailbox.Pass1", "", &owner)
            .await
            .expect("dotted name is fine");
    }

    #[tokio::test]
    async fn mailbox_login_checks_active_and_password() {
        let directory = directory().await;
        let email = addr("inbox01@d.test");
        directory
            .create_mailbox(&email, "Mailbox.Pass1", "", &addr("owner@d.test"))
            .await
            .expect("create");

        directory
            .validate_mailbox(&email, "Mailbox.Pass1")
            .await
            .expect("valid login");
        let err = directory
            .validate_mailbox(&email, "wrong")
            .await
            .expect_err("wrong password");
        assert_eq!(err, Fault::InvalidCredentials);
        let err = directory
            .validate_mailbox(&addr("ghost@d.test"), "Mailbox.Pass1")
            .await
            .expect_err("unknown mailbox");
        assert_eq!(err, Fault::InvalidCredentials);
    }

    #[tokio::test]
    async fn forwarding_needs_a_target_when_enabled() {
        let directory = directory().await;
        let email = addr("inbox01@d.test");
        directory
            .create_mailbox(&email, "Mailbox.Pass1", "", &addr("owner@d.test"))
            .await
            .expect("create");

        let err = directory
            .update_forwarding(&email, None, true, true)
            .await
            .expect_err("no target");
        assert!(matches!(err, Fault::ValidationFailed(_)));

        directory
            .update_forwarding(&email, Some(&addr("b@e.test")), true, false)
            .await
            .expect("rule written");
        let rule = directory.lookup(&email).await.expect("lookup").expect("present");
        assert!(rule.forward_enabled);
        assert!(!rule.keep_original);
    }

    #[tokio::test]
    async fn cached_lookup_sees_forwarding_updates() {
        let directory = directory().await;
        let email = addr("inbox01@d.test");
        directory
            .create_mailbox(&email, "Mailbox.Pass1", "", &addr("owner@d.test"))
            .await
            .expect("create");
        // Prime the cache, then change the rule behind it.
        assert!(directory.lookup(&email).await.expect("lookup").is_some());
        directory
            .update_forwarding(&email, Some(&addr("b@e.test")), true, true)
            .await
            .expect("update");
        let rule = directory.lookup(&email).await.expect("lookup").expect("present");
        assert!(rule.forward_enabled);
    }

    #[tokio::test]
    async fn unknown_mailbox_updates_fail() {
        let directory = directory().await;
        let err = directory
            .update_forwarding(&addr("ghost@d.test"), None, false, true)
            .await
            .expect_err("unknown");
        assert_eq!(err, Fault::UnknownRecipient);
    }
}
