//! Persistent store: narrow CRUD surfaces over SQLite for users, sessions,
//! mailboxes, messages, and send tasks. Transactions are per-operation;
//! durability holds once a call returns.

pub mod mailboxes;
pub mod messages;
pub mod sessions;
pub mod tasks;
pub mod users;

use std::fmt::Display;

use pelican_structs::fault::Fault;

/// Map a backend error to the one fault kind callers retry on, keeping the
/// specific cause in the log only.
pub(crate) fn store_fault(err: impl Display) -> Fault {
    tracing::error!("store error: {err}");
    Fault::BackendUnavailable
}

/// Test support: in-memory databases running the real migrations. Used by
/// unit and integration tests; never by the server itself.
pub mod testing {
    use sqlx::SqlitePool;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Fresh in-memory database with the real schema. One connection so the
    /// `:memory:` database is shared across all acquires.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");
        pool
    }
}
