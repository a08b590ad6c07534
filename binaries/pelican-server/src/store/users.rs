use sqlx::SqlitePool;
use pelican_structs::address::EmailAddress;
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

use crate::store::store_fault;

/// One row of the user directory. Mutated only through the credential
/// service.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub email: EmailAddress,
    pub password_hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub is_admin: bool,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<Timestamp>,
    pub created_at: Timestamp,
    pub last_login: Option<Timestamp>,
}

pub async fn insert_user(pool: &SqlitePool, user: &UserRecord) -> Result<(), Fault> {
    let result = sqlx::query(
        "INSERT INTO users \
         (email, password_hash, salt, is_admin, totp_secret, totp_enabled, \
          failed_attempts, locked_until, created_at, last_login) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user.email.as_str())
    .bind(&user.password_hash)
    .bind(&user.salt)
    .bind(i64::from(user.is_admin))
    .bind(&user.totp_secret)
    .bind(i64::from(user.totp_enabled))
    .bind(user.failed_attempts as i64)
    .bind(user.locked_until.map(|t| t.0 as i64))
    .bind(user.created_at.0 as i64)
    .bind(user.last_login.map(|t| t.0 as i64))
    .execute(pool)
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(Fault::ValidationFailed("email already registered".into()))
        }
        Err(err) => Err(store_fault(err)),
    }
}

type UserRow = (
    String,
    Vec<u8>,
    Vec<u8>,
    i64,
    Option<String>,
    i64,
    i64,
    Option<i64>,
    i64,
    Option<i64>,
);

fn row_to_user(row: UserRow) -> Result<UserRecord, Fault> {
    let (
        email,
        password_hash,
        salt,
        is_admin,
        totp_secret,
        totp_enabled,
        failed_attempts,
        locked_until,
        created_at,
        last_login,
    ) = row;
    Ok(UserRecord {
        email: EmailAddress::parse(&email).map_err(store_fault)?,
        password_hash,
        salt,
        is_admin: is_admin != 0,
        totp_secret,
        totp_enabled: totp_enabled != 0,
        failed_attempts: failed_attempts.max(0) as u32,
        locked_until: locked_until.map(|t| Timestamp(t as u64)),
        created_at: Timestamp(created_at as u64),
        last_login: last_login.map(|t| Timestamp(t as u64)),
    })
}

pub async fn load_user(pool: &SqlitePool, email: &EmailAddress) -> Result<Option<UserRecord>, Fault> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT email, password_hash, salt, is_admin, totp_secret, totp_enabled, \
                failed_attempts, locked_until, created_at, last_login \
         FROM users WHERE email = ?",
    )
    .bind(email.as_str())
    .fetch_optional(pool)
    .await
    .map_err(store_fault)?;
    row.map(row_to_user).transpose()
}

pub async fn any_admin_exists(pool: &SqlitePool) -> Result<bool, Fault> {
    let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE is_admin = 1 LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(store_fault)?;
    Ok(row.is_some())
}

/// Delete a user. The cascade to its sessions is this explicit statement,
/// not a foreign-key traversal.
pub async fn delete_user(pool: &SqlitePool, email: &EmailAddress) -> Result<(), Fault> {
    let mut tx = pool.begin().await.map_err(store_fault)?;
    sqlx::query("DELETE FROM sessions WHERE subject_email = ?")
        .bind(email.as_str())
        .execute(tx.as_mut())
        .await
        .map_err(store_fault)?;
    sqlx::query("DELETE FROM users WHERE email = ?")
        .bind(email.as_str())
        .execute(tx.as_mut())
        .await
        .map_err(store_fault)?;
    tx.commit().await.map_err(store_fault)?;
    Ok(())
}

pub async fn record_failure(
    pool: &SqlitePool,
    email: &EmailAddress,
    failed_attempts: u32,
    locked_until: Option<Timestamp>,
) -> Result<(), Fault> {
    sqlx::query("UPDATE users SET failed_attempts = ?, locked_until = ? WHERE email = ?")
        .bind(failed_attempts as i64)
        .bind(locked_until.map(|t| t.0 as i64))
        .bind(email.as_str())
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(())
}

pub async fn record_success(
    pool: &SqlitePool,
    email: &EmailAddress,
    at: Timestamp,
) -> Result<(), Fault> {
    sqlx::query(
        "UPDATE users SET failed_attempts = 0, locked_until = NULL, last_login = ? WHERE email = ?",
    )
    .bind(at.0 as i64)
    .bind(email.as_str())
    .execute(pool)
    .await
    .map_err(store_fault)?;
    Ok(())
}

pub async fn set_totp(
    pool: &SqlitePool,
    email: &EmailAddress,
    secret: Option<&str>,
    enabled: bool,
) -> Result<(), Fault> {
    sqlx::query("UPDATE users SET totp_secret = ?, totp_enabled = ? WHERE email = ?")
        .bind(secret)
        .bind(i64::from(enabled))
        .bind(email.as_str())
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(())
}
