use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use pelican_crypt::seal::{SealedField, SealedMessage};
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::message::{MessageId, StoredMessage};
use pelican_structs::timestamp::{NanoTimestamp, Timestamp};

use crate::store::store_fault;

/// Persist one encrypted record. `received_at` is assigned by the insert
/// itself (one past the mailbox maximum, or the clock, whichever is later),
/// so it is strictly increasing within the mailbox even under concurrent
/// writers; the value actually stored is returned.
pub async fn put_message(pool: &SqlitePool, message: &StoredMessage) -> Result<NanoTimestamp, Fault> {
    let received_at = sqlx::query_scalar::<_, i64>(
        "INSERT INTO messages \
         (id, mailbox, sender, recipient, received_at, \
          subject_ciphertext, subject_salt, subject_nonce, \
          body_ciphertext, body_salt, body_nonce, \
          headers_ciphertext, headers_salt, headers_nonce, \
          algorithm, key_version, search_index, encrypted_at) \
         VALUES (?1, ?2, ?3, ?4, \
                 MAX(?5, COALESCE((SELECT MAX(received_at) FROM messages WHERE mailbox = ?2), 0) + 1), \
                 ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18) \
         RETURNING received_at",
    )
    .bind(message.id.to_bytes().to_vec())
    .bind(message.mailbox.as_str())
    .bind(message.sender.as_str())
    .bind(message.recipient.as_str())
    .bind(NanoTimestamp::now().0 as i64)
    .bind(&message.sealed.subject.ciphertext)
    .bind(message.sealed.subject.salt.to_vec())
    .bind(message.sealed.subject.nonce.to_vec())
    .bind(&message.sealed.body.ciphertext)
    .bind(message.sealed.body.salt.to_vec())
    .bind(message.sealed.body.nonce.to_vec())
    .bind(&message.sealed.headers.ciphertext)
    .bind(message.sealed.headers.salt.to_vec())
    .bind(message.sealed.headers.nonce.to_vec())
    .bind(&message.sealed.algorithm)
    .bind(message.sealed.key_version as i64)
    .bind(&message.sealed.search_index)
    .bind(message.encrypted_at.0 as i64)
    .fetch_one(pool)
    .await
    .map_err(store_fault)?;
    Ok(NanoTimestamp(received_at as u64))
}

fn field_from_row(row: &SqliteRow, prefix: &str) -> Result<SealedField, Fault> {
    let ciphertext: Vec<u8> = row
        .try_get(format!("{prefix}_ciphertext").as_str())
        .map_err(store_fault)?;
    let salt: Vec<u8> = row
        .try_get(format!("{prefix}_salt").as_str())
        .map_err(store_fault)?;
    let nonce: Vec<u8> = row
        .try_get(format!("{prefix}_nonce").as_str())
        .map_err(store_fault)?;
    SealedField::from_parts(ciphertext, &salt, &nonce)
        .map_err(|err| Fault::ValidationFailed(err.to_string()))
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage, Fault> {
    let id: Vec<u8> = row.try_get("id").map_err(store_fault)?;
    let id: [u8; 16] = id
        .try_into()
        .map_err(|_| Fault::ValidationFailed("malformed message id".into()))?;
    let mailbox: String = row.try_get("mailbox").map_err(store_fault)?;
    let sender: String = row.try_get("sender").map_err(store_fault)?;
    let recipient: String = row.try_get("recipient").map_err(store_fault)?;
    let received_at: i64 = row.try_get("received_at").map_err(store_fault)?;
    let algorithm: String = row.try_get("algorithm").map_err(store_fault)?;
    let key_version: i64 = row.try_get("key_version").map_err(store_fault)?;
    let search_index: String = row.try_get("search_index").map_err(store_fault)?;
    let encrypted_at: i64 = row.try_get("encrypted_at").map_err(store_fault)?;

    Ok(StoredMessage {
        id: MessageId::from_bytes(id),
        mailbox: EmailAddress::parse(&mailbox).map_err(store_fault)?,
        sender: EmailAddress::parse(&sender).map_err(store_fault)?,
        recipient: EmailAddress::parse(&recipient).map_err(store_fault)?,
        received_at: NanoTimestamp(received_at as u64),
        sealed: SealedMessage {
            subject: field_from_row(row, "subject")?,
            body: field_from_row(row, "body")?,
            headers: field_from_row(row, "headers")?,
            search_index,
            algorithm,
            key_version: key_version as u32,
        },
        encrypted_at: Timestamp(encrypted_at as u64),
    })
}

/// Page through a mailbox, newest first.
pub async fn list_messages(
    pool: &SqlitePool,
    mailbox: &EmailAddress,
    limit: u32,
    offset: u32,
) -> Result<Vec<StoredMessage>, Fault> {
    let rows = sqlx::query(
        "SELECT * FROM messages WHERE mailbox = ? \
         ORDER BY received_at DESC LIMIT ? OFFSET ?",
    )
    .bind(mailbox.as_str())
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await
    .map_err(store_fault)?;
    rows.iter().map(row_to_message).collect()
}

pub async fn load_message(
    pool: &SqlitePool,
    mailbox: &EmailAddress,
    id: &MessageId,
) -> Result<Option<StoredMessage>, Fault> {
    let row = sqlx::query("SELECT * FROM messages WHERE mailbox = ? AND id = ?")
        .bind(mailbox.as_str())
        .bind(id.to_bytes().to_vec())
        .fetch_optional(pool)
        .await
        .map_err(store_fault)?;
    row.as_ref().map(row_to_message).transpose()
}

pub async fn delete_message(
    pool: &SqlitePool,
    mailbox: &EmailAddress,
    id: &MessageId,
) -> Result<bool, Fault> {
    let result = sqlx::query("DELETE FROM messages WHERE mailbox = ? AND id = ?")
        .bind(mailbox.as_str())
        .bind(id.to_bytes().to_vec())
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_messages(pool: &SqlitePool, mailbox: &EmailAddress) -> Result<u64, Fault> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE mailbox = ?")
        .bind(mailbox.as_str())
        .fetch_one(pool)
        .await
        .map_err(store_fault)?;
    Ok(count.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::memory_pool;
    use pelican_crypt::seal::Sealer;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).expect("addr")
    }

    fn record(sealer: &Sealer, mailbox: &str, subject: &str) -> StoredMessage {
        StoredMessage {
            id: MessageId::random(),
            mailbox: addr(mailbox),
            sender: addr("sender@e.test"),
            recipient: addr(mailbox),
            received_at: NanoTimestamp(0),
            sealed: sealer
                .seal_message(subject, "body text", "[]")
                .expect("seal"),
            encrypted_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn put_list_roundtrip_newest_first() {
        let pool = memory_pool().await;
        let sealer = Sealer::new([5u8; 32]);
        let first = record(&sealer, "a@d.test", "first");
        let second = record(&sealer, "a@d.test", "second");
        put_message(&pool, &first).await.expect("put");
        put_message(&pool, &second).await.expect("put");

        let listed = list_messages(&pool, &addr("a@d.test"), 10, 0).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert!(listed[0].received_at > listed[1].received_at);
    }

    #[tokio::test]
    async fn received_at_strictly_increases_per_mailbox() {
        let pool = memory_pool().await;
        let sealer = Sealer::new([5u8; 32]);
        let mut stamps = Vec::new();
        for i in 0..5 {
            let stamp = put_message(&pool, &record(&sealer, "a@d.test", &format!("m{i}")))
                .await
                .expect("put");
            stamps.push(stamp);
        }
        for pair in stamps.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[tokio::test]
    async fn delete_removes_only_target() {
        let pool = memory_pool().await;
        let sealer = Sealer::new([5u8; 32]);
        let keep = record(&sealer, "a@d.test", "keep");
        let gone = record(&sealer, "a@d.test", "gone");
        put_message(&pool, &keep).await.expect("put");
        put_message(&pool, &gone).await.expect("put");

        assert!(delete_message(&pool, &addr("a@d.test"), &gone.id).await.expect("delete"));
        assert_eq!(count_messages(&pool, &addr("a@d.test")).await.expect("count"), 1);
        assert!(
            load_message(&pool, &addr("a@d.test"), &keep.id)
                .await
                .expect("load")
                .is_some()
        );
    }

    #[tokio::test]
    async fn stored_record_opens_to_original_plaintext() {
        let pool = memory_pool().await;
        let sealer = Sealer::new([5u8; 32]);
        let message = record(&sealer, "a@d.test", "roundtrip subject");
        put_message(&pool, &message).await.expect("put");

        let loaded = load_message(&pool, &addr("a@d.test"), &message.id)
            .await
            .expect("load")
            .expect("present");
        let open = sealer.open_message(&loaded.sealed).expect("open");
        assert_eq!(open.subject, "roundtrip subject");
        assert_eq!(open.body, "body text");
    }
}
