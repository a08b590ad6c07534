//! The read model the IMAP front-end translates to: mailbox listings,
//! paginated decrypted summaries, full fetches, deletes, and index-backed
//! search. No protocol grammar lives here.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use pelican_crypt::seal::{SealError, Sealer};
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::header::headers_from_json;
use pelican_structs::message::{MessageId, MessageSummary, OpenedMessage, StoredMessage};

use crate::backends::Backends;
use crate::store::{mailboxes, messages};

/// One line of the mailbox listing.
#[derive(Clone, Debug, Serialize)]
pub struct MailboxListing {
    pub email: EmailAddress,
    pub description: String,
    pub active: bool,
    pub total: u64,
}

pub struct Inbox {
    db: SqlitePool,
    sealer: Arc<Sealer>,
    backends: Arc<Backends>,
}

impl Inbox {
    pub fn new(db: SqlitePool, sealer: Arc<Sealer>, backends: Arc<Backends>) -> Self {
        Self { db, sealer, backends }
    }

    pub async fn list_mailboxes(&self) -> Result<Vec<MailboxListing>, Fault> {
        let _permit = self.backends.store_permit().await?;
        let records = mailboxes::list_mailboxes(&self.db).await?;
        let mut listings = Vec::with_capacity(records.len());
        for record in records {
            let total = messages::count_messages(&self.db, &record.email).await?;
            listings.push(MailboxListing {
                email: record.email,
                description: record.description,
                active: record.active,
                total,
            });
        }
        Ok(listings)
    }

    /// Page of decrypted header summaries, newest first. A record that
    /// fails authentication is logged and skipped; the rest of the page is
    /// unaffected.
    pub async fn list_messages(
        &self,
        mailbox: &EmailAddress,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessageSummary>, Fault> {
        let limit = limit.clamp(1, 200);
        let _permit = self.backends.store_permit().await?;
        let records = messages::list_messages(&self.db, mailbox, limit, page * limit).await?;
        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            match self.open_summary(&record) {
                Ok(summary) => summaries.push(summary),
                Err(SealError::Auth) => {
                    tracing::warn!(
                        mailbox = %mailbox,
                        message = %record.id,
                        "skipping message that failed authentication"
                    );
                }
                Err(err) => {
                    tracing::warn!(mailbox = %mailbox, message = %record.id, %err, "skipping unreadable message");
                }
            }
        }
        Ok(summaries)
    }

    fn open_summary(&self, record: &StoredMessage) -> Result<MessageSummary, SealError> {
        record.sealed.validate()?;
        let subject = self.sealer.open_field(&record.sealed.subject)?;
        Ok(MessageSummary {
            id: record.id,
            sender: record.sender.clone(),
            subject: String::from_utf8(subject)
                .map_err(|_| SealError::Validation("subject is not utf-8"))?,
            received_at: record.received_at,
        })
    }

    /// Fully decrypt one message.
    pub async fn fetch(
        &self,
        mailbox: &EmailAddress,
        id: &MessageId,
    ) -> Result<OpenedMessage, Fault> {
        let _permit = self.backends.store_permit().await?;
        let record = messages::load_message(&self.db, mailbox, id)
            .await?
            .ok_or_else(|| Fault::ValidationFailed("no such message".into()))?;
        let open = self.sealer.open_message(&record.sealed).map_err(|err| match err {
            SealError::Auth => Fault::DecryptAuthFailure,
            other => Fault::ValidationFailed(other.to_string()),
        })?;
        let headers = headers_from_json(&open.headers)
            .map_err(|_| Fault::ValidationFailed("malformed stored headers".into()))?;
        Ok(OpenedMessage {
            id: record.id,
            mailbox: record.mailbox,
            sender: record.sender,
            recipient: record.recipient,
            received_at: record.received_at,
            subject: open.subject,
            body: open.body,
            headers,
        })
    }

    pub async fn delete(&self, mailbox: &EmailAddress, id: &MessageId) -> Result<(), Fault> {
        let _permit = self.backends.store_permit().await?;
        if !messages::delete_message(&self.db, mailbox, id).await? {
            return Err(Fault::ValidationFailed("no such message".into()));
        }
        tracing::debug!(mailbox = %mailbox, message = %id, "message deleted");
        Ok(())
    }

    /// Search the keyed index without decrypting bodies. Matching records
    /// are returned as decrypted summaries.
    pub async fn search(
        &self,
        mailbox: &EmailAddress,
        query: &str,
    ) -> Result<Vec<MessageSummary>, Fault> {
        let _permit = self.backends.store_permit().await?;
        // The index answers substring queries; walk pages of the mailbox
        // and filter locally.
        let mut found = Vec::new();
        let mut page = 0;
        loop {
            let records = messages::list_messages(&self.db, mailbox, 200, page * 200).await?;
            if records.is_empty() {
                break;
            }
            for record in &records {
                if self.sealer.search(&record.sealed.search_index, query)
                    && let Ok(summary) = self.open_summary(record)
                {
                    found.push(summary);
                }
            }
            page += 1;
        }
        Ok(found)
    }
}
