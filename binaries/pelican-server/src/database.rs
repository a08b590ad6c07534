use std::sync::LazyLock;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::config::CONFIG;

pub static DATABASE: LazyLock<SqlitePool> = LazyLock::new(|| {
    let options = SqliteConnectOptions::new()
        .filename(CONFIG.db_path.clone())
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
    SqlitePoolOptions::new()
        .max_connections(CONFIG.pool.max_open)
        .min_connections(CONFIG.pool.max_idle)
        .max_lifetime(Duration::from_secs(CONFIG.pool.max_lifetime_secs))
        .idle_timeout(Duration::from_secs(CONFIG.pool.max_idle_secs))
        .connect_lazy_with(options)
});

pub async fn init_database() -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(&*DATABASE).await?;
    Ok(())
}
