use sqlx::SqlitePool;
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

use crate::store::store_fault;

/// One issued token, kept until its natural expiry for auditing and
/// revocation checks.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub token_id: String,
    pub subject_email: EmailAddress,
    pub is_admin: bool,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub kind: String,
}

pub async fn insert_session(pool: &SqlitePool, session: &SessionRecord) -> Result<(), Fault> {
    sqlx::query(
        "INSERT OR REPLACE INTO sessions \
         (token_id, subject_email, is_admin, issued_at, expires_at, kind) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&session.token_id)
    .bind(session.subject_email.as_str())
    .bind(i64::from(session.is_admin))
    .bind(session.issued_at.0 as i64)
    .bind(session.expires_at.0 as i64)
    .bind(&session.kind)
    .execute(pool)
    .await
    .map_err(store_fault)?;
    Ok(())
}

/// Drop sessions whose expiry has passed. Returns how many were removed.
pub async fn purge_expired(pool: &SqlitePool, now: Timestamp) -> Result<u64, Fault> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now.0 as i64)
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(result.rows_affected())
}

pub async fn blacklist_token(
    pool: &SqlitePool,
    token_id: &str,
    expires_at: Timestamp,
) -> Result<(), Fault> {
    sqlx::query("INSERT OR REPLACE INTO token_blacklist (token_id, expires_at) VALUES (?, ?)")
        .bind(token_id)
        .bind(expires_at.0 as i64)
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(())
}

pub async fn is_blacklisted(pool: &SqlitePool, token_id: &str) -> Result<bool, Fault> {
    let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM token_blacklist WHERE token_id = ?")
        .bind(token_id)
        .fetch_optional(pool)
        .await
        .map_err(store_fault)?;
    Ok(row.is_some())
}

/// Drop blacklist entries whose token would have expired anyway.
pub async fn purge_blacklist(pool: &SqlitePool, now: Timestamp) -> Result<u64, Fault> {
    let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= ?")
        .bind(now.0 as i64)
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(result.rows_affected())
}
