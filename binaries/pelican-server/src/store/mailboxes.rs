use sqlx::SqlitePool;
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

use crate::store::store_fault;

/// One mailbox: a delivery destination with its own credentials and
/// forwarding rule, distinct from the user that owns it.
#[derive(Clone, Debug)]
pub struct MailboxRecord {
    pub email: EmailAddress,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub description: String,
    pub owner: EmailAddress,
    pub active: bool,
    pub forward_to: Option<EmailAddress>,
    pub forward_enabled: bool,
    pub keep_original: bool,
    pub created_at: Timestamp,
}

pub async fn insert_mailbox(pool: &SqlitePool, mailbox: &MailboxRecord) -> Result<(), Fault> {
    let result = sqlx::query(
        "INSERT INTO mailboxes \
         (email, password_hash, salt, description, owner, active, \
          forward_to, forward_enabled, keep_original, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(mailbox.email.as_str())
    .bind(&mailbox.password_hash)
    .bind(&mailbox.salt)
    .bind(&mailbox.description)
    .bind(mailbox.owner.as_str())
    .bind(i64::from(mailbox.active))
    .bind(mailbox.forward_to.as_ref().map(|a| a.as_str().to_string()))
    .bind(i64::from(mailbox.forward_enabled))
    .bind(i64::from(mailbox.keep_original))
    .bind(mailbox.created_at.0 as i64)
    .execute(pool)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(Fault::ValidationFailed("mailbox already exists".into()))
        }
        Err(err) => Err(store_fault(err)),
    }
}

type MailboxRow = (
    String,
    Vec<u8>,
    Vec<u8>,
    String,
    String,
    i64,
    Option<String>,
    i64,
    i64,
    i64,
);

fn row_to_mailbox(row: MailboxRow) -> Result<MailboxRecord, Fault> {
    let (
        email,
        password_hash,
        salt,
        description,
        owner,
        active,
        forward_to,
        forward_enabled,
        keep_original,
        created_at,
    ) = row;
    let forward_to = forward_to
        .map(|addr| EmailAddress::parse(&addr).map_err(store_fault))
        .transpose()?;
    Ok(MailboxRecord {
        email: EmailAddress::parse(&email).map_err(store_fault)?,
        password_hash,
        salt,
        description,
        owner: EmailAddress::parse(&owner).map_err(store_fault)?,
        active: active != 0,
        forward_to,
        forward_enabled: forward_enabled != 0,
        keep_original: keep_original != 0,
        created_at: Timestamp(created_at as u64),
    })
}

const MAILBOX_COLUMNS: &str = "email, password_hash, salt, description, owner, active, \
                               forward_to, forward_enabled, keep_original, created_at";

pub async fn load_mailbox(
    pool: &SqlitePool,
    email: &EmailAddress,
) -> Result<Option<MailboxRecord>, Fault> {
    let row = sqlx::query_as::<_, MailboxRow>(&format!(
        "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE email = ?"
    ))
    .bind(email.as_str())
    .fetch_optional(pool)
    .await
    .map_err(store_fault)?;
    row.map(row_to_mailbox).transpose()
}

pub async fn list_mailboxes(pool: &SqlitePool) -> Result<Vec<MailboxRecord>, Fault> {
    let rows = sqlx::query_as::<_, MailboxRow>(&format!(
        "SELECT {MAILBOX_COLUMNS} FROM mailboxes ORDER BY email"
    ))
    .fetch_all(pool)
    .await
    .map_err(store_fault)?;
    rows.into_iter().map(row_to_mailbox).collect()
}

pub async fn delete_mailbox(pool: &SqlitePool, email: &EmailAddress) -> Result<bool, Fault> {
    let mut tx = pool.begin().await.map_err(store_fault)?;
    sqlx::query("DELETE FROM messages WHERE mailbox = ?")
        .bind(email.as_str())
        .execute(tx.as_mut())
        .await
        .map_err(store_fault)?;
    let result = sqlx::query("DELETE FROM mailboxes WHERE email = ?")
        .bind(email.as_str())
        .execute(tx.as_mut())
        .await
        .map_err(store_fault)?;
    tx.commit().await.map_err(store_fault)?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_forwarding(
    pool: &SqlitePool,
    email: &EmailAddress,
    forward_to: Option<&EmailAddress>,
    forward_enabled: bool,
    keep_original: bool,
) -> Result<bool, Fault> {
    let result = sqlx::query(
        "UPDATE mailboxes SET forward_to = ?, forward_enabled = ?, keep_original = ? \
         WHERE email = ?",
    )
    .bind(forward_to.map(|a| a.as_str().to_string()))
    .bind(i64::from(forward_enabled))
    .bind(i64::from(keep_original))
    .bind(email.as_str())
    .execute(pool)
    .await
    .map_err(store_fault)?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::memory_pool;

    pub(crate) fn mailbox(email: &str) -> MailboxRecord {
        MailboxRecord {
            email: EmailAddress::parse(email).expect("addr"),
            password_hash: vec![1; 32],
            salt: vec![2; 16],
            description: "test box".into(),
            owner: EmailAddress::parse("owner@d.test").expect("addr"),
            active: true,
            forward_to: None,
            forward_enabled: false,
            keep_original: true,
            created_at: Timestamp(1),
        }
    }

    #[tokio::test]
    async fn insert_load_roundtrip() {
        let pool = memory_pool().await;
        insert_mailbox(&pool, &mailbox("a@d.test")).await.expect("insert");
        let loaded = load_mailbox(&pool, &EmailAddress::parse("a@d.test").expect("addr"))
            .await
            .expect("load")
            .expect("present");
        assert!(loaded.active);
        assert_eq!(loaded.owner.as_str(), "owner@d.test");
        assert!(loaded.forward_to.is_none());
    }

    #[tokio::test]
    async fn forwarding_update_is_visible() {
        let pool = memory_pool().await;
        let addr = EmailAddress::parse("a@d.test").expect("addr");
        let target = EmailAddress::parse("b@e.test").expect("addr");
        insert_mailbox(&pool, &mailbox("a@d.test")).await.expect("insert");
        assert!(
            update_forwarding(&pool, &addr, Some(&target), true, false)
                .await
                .expect("update")
        );
        let loaded = load_mailbox(&pool, &addr).await.expect("load").expect("present");
        assert!(loaded.forward_enabled);
        assert!(!loaded.keep_original);
        assert_eq!(loaded.forward_to, Some(target));
    }

    #[tokio::test]
    async fn delete_missing_mailbox_reports_false() {
        let pool = memory_pool().await;
        let addr = EmailAddress::parse("nope@d.test").expect("addr");
        assert!(!delete_mailbox(&pool, &addr).await.expect("delete"));
    }
}
