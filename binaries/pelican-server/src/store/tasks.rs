use sqlx::SqlitePool;
use pelican_structs::fault::Fault;
use pelican_structs::task::{SendTask, TaskId, TaskStatus};
use pelican_structs::timestamp::Timestamp;

use crate::store::store_fault;

fn encode(task: &SendTask) -> Result<String, Fault> {
    serde_json::to_string(task).map_err(store_fault)
}

fn decode(payload: &str) -> Result<SendTask, Fault> {
    serde_json::from_str(payload).map_err(store_fault)
}

/// Write or refresh the durable copy of a task. The queryable columns
/// mirror the payload so sweepers never have to parse JSON.
pub async fn upsert_task(pool: &SqlitePool, task: &SendTask) -> Result<(), Fault> {
    sqlx::query(
        "INSERT OR REPLACE INTO send_tasks \
         (id, kind, priority, status, retry_count, not_before, created_at, \
          processed_at, last_error, payload) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id.to_bytes().to_vec())
    .bind(task.kind.as_str())
    .bind(task.priority.as_i64())
    .bind(task.status.as_str())
    .bind(task.retry_count as i64)
    .bind(task.not_before.map(|t| t.0 as i64))
    .bind(task.created_at.0 as i64)
    .bind(task.processed_at.map(|t| t.0 as i64))
    .bind(&task.last_error)
    .bind(encode(task)?)
    .execute(pool)
    .await
    .map_err(store_fault)?;
    Ok(())
}

pub async fn remove_task(pool: &SqlitePool, id: &TaskId) -> Result<(), Fault> {
    sqlx::query("DELETE FROM send_tasks WHERE id = ?")
        .bind(id.to_bytes().to_vec())
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(())
}

pub async fn load_task(pool: &SqlitePool, id: &TaskId) -> Result<Option<SendTask>, Fault> {
    let payload =
        sqlx::query_scalar::<_, String>("SELECT payload FROM send_tasks WHERE id = ?")
            .bind(id.to_bytes().to_vec())
            .fetch_optional(pool)
            .await
            .map_err(store_fault)?;
    payload.as_deref().map(decode).transpose()
}

/// Tasks that were pending when the process stopped; replayed at startup.
pub async fn pending_tasks(pool: &SqlitePool) -> Result<Vec<SendTask>, Fault> {
    let payloads = sqlx::query_scalar::<_, String>(
        "SELECT payload FROM send_tasks WHERE status = 'pending' ORDER BY priority, created_at",
    )
    .fetch_all(pool)
    .await
    .map_err(store_fault)?;
    payloads.iter().map(|p| decode(p)).collect()
}

/// Retry-store entries whose `not_before` has passed.
pub async fn due_retries(pool: &SqlitePool, now: Timestamp) -> Result<Vec<SendTask>, Fault> {
    let payloads = sqlx::query_scalar::<_, String>(
        "SELECT payload FROM send_tasks \
         WHERE status = 'retry' AND (not_before IS NULL OR not_before <= ?) \
         ORDER BY priority, created_at",
    )
    .bind(now.0 as i64)
    .fetch_all(pool)
    .await
    .map_err(store_fault)?;
    payloads.iter().map(|p| decode(p)).collect()
}

pub async fn count_by_status(pool: &SqlitePool, status: TaskStatus) -> Result<u64, Fault> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM send_tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(pool)
            .await
            .map_err(store_fault)?;
    Ok(count.max(0) as u64)
}

/// Retire a task whose retry budget is exhausted: removed from the send
/// queue, kept in the dead-letter store for the retention window.
pub async fn move_to_dead_letter(
    pool: &SqlitePool,
    task: &SendTask,
    failed_at: Timestamp,
) -> Result<(), Fault> {
    let mut tx = pool.begin().await.map_err(store_fault)?;
    sqlx::query("DELETE FROM send_tasks WHERE id = ?")
        .bind(task.id.to_bytes().to_vec())
        .execute(tx.as_mut())
        .await
        .map_err(store_fault)?;
    sqlx::query(
        "INSERT OR REPLACE INTO dead_letters (id, failed_at, last_error, payload) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(task.id.to_bytes().to_vec())
    .bind(failed_at.0 as i64)
    .bind(&task.last_error)
    .bind(encode(task)?)
    .execute(tx.as_mut())
    .await
    .map_err(store_fault)?;
    tx.commit().await.map_err(store_fault)?;
    Ok(())
}

pub async fn dead_letters(pool: &SqlitePool) -> Result<Vec<SendTask>, Fault> {
    let payloads = sqlx::query_scalar::<_, String>(
        "SELECT payload FROM dead_letters ORDER BY failed_at DESC",
    )
    .fetch_all(pool)
    .await
    .map_err(store_fault)?;
    payloads.iter().map(|p| decode(p)).collect()
}

/// Drop dead letters older than the retention cutoff.
pub async fn purge_dead_letters(pool: &SqlitePool, cutoff: Timestamp) -> Result<u64, Fault> {
    let result = sqlx::query("DELETE FROM dead_letters WHERE failed_at <= ?")
        .bind(cutoff.0 as i64)
        .execute(pool)
        .await
        .map_err(store_fault)?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::memory_pool;
    use pelican_structs::address::EmailAddress;
    use pelican_structs::task::TaskKind;

    fn task() -> SendTask {
        SendTask::new(
            TaskKind::Outgoing,
            EmailAddress::parse("a@d.test").expect("addr"),
            vec![EmailAddress::parse("b@e.test").expect("addr")],
            "subject",
            "body",
        )
    }

    #[tokio::test]
    async fn upsert_and_load_roundtrip() {
        let pool = memory_pool().await;
        let task = task();
        upsert_task(&pool, &task).await.expect("upsert");
        let loaded = load_task(&pool, &task.id).await.expect("load").expect("present");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.subject, "subject");
        assert_eq!(loaded.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn pending_tasks_are_replayable() {
        let pool = memory_pool().await;
        let mut done = task();
        done.status = TaskStatus::Completed;
        upsert_task(&pool, &task()).await.expect("upsert");
        upsert_task(&pool, &done).await.expect("upsert");

        let replayable = pending_tasks(&pool).await.expect("pending");
        assert_eq!(replayable.len(), 1);
        assert_eq!(replayable[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn due_retries_respect_not_before() {
        let pool = memory_pool().await;
        let mut due = task();
        due.status = TaskStatus::Retry;
        due.not_before = Some(Timestamp(100));
        let mut later = task();
        later.status = TaskStatus::Retry;
        later.not_before = Some(Timestamp(10_000));
        upsert_task(&pool, &due).await.expect("upsert");
        upsert_task(&pool, &later).await.expect("upsert");

        let eligible = due_retries(&pool, Timestamp(500)).await.expect("due");
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, due.id);
    }

    #[tokio::test]
    async fn dead_letter_move_and_retention() {
        let pool = memory_pool().await;
        let mut failed = task();
        failed.status = TaskStatus::Failed;
        failed.last_error = Some("relay gone".into());
        upsert_task(&pool, &failed).await.expect("upsert");

        move_to_dead_letter(&pool, &failed, Timestamp(1_000))
            .await
            .expect("move");
        assert!(load_task(&pool, &failed.id).await.expect("load").is_none());
        assert_eq!(dead_letters(&pool).await.expect("list").len(), 1);

        let purged = purge_dead_letters(&pool, Timestamp(2_000)).await.expect("purge");
        assert_eq!(purged, 1);
        assert!(dead_letters(&pool).await.expect("list").is_empty());
    }
}
