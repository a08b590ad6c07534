//! The send queue: a bounded processing channel in front of the worker
//! pool, a durable retry store, and the dead-letter store. Enqueuing never
//! blocks; a full channel is the caller's signal to back off.

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use pelican_structs::fault::Fault;
use pelican_structs::task::{SendTask, TaskId, TaskStatus};
use pelican_structs::timestamp::Timestamp;

use crate::config::QueueConfig;
use crate::store::tasks;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct QueueDepths {
    pub channel: usize,
    pub channel_capacity: usize,
    pub retry: u64,
    pub dead_letter: u64,
}

pub struct SendQueue {
    tx: mpsc::Sender<SendTask>,
    db: SqlitePool,
    config: QueueConfig,
}

impl SendQueue {
    /// Build the queue and hand back the receive side for the worker pool.
    pub fn new(db: SqlitePool, config: QueueConfig) -> (Self, mpsc::Receiver<SendTask>) {
        let (tx, rx) = mpsc::channel(config.capacity);
        (Self { tx, db, config }, rx)
    }

    /// Durable submission, used by the API boundary: the task is persisted
    /// before it enters the channel, so it survives a restart.
    pub async fn submit(&self, mut task: SendTask) -> Result<TaskId, Fault> {
        task.max_retries = self.config.max_retries;
        let id = task.id;
        tasks::upsert_task(&self.db, &task).await?;
        match self.tx.try_send(task) {
            Ok(()) => {
                tracing::debug!(task = %id, "task submitted");
                Ok(id)
            }
            Err(TrySendError::Full(task)) => {
                // Undo the durable copy; the caller retries the whole call.
                tasks::remove_task(&self.db, &task.id).await?;
                tracing::warn!(task = %id, "send queue full");
                Err(Fault::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(Fault::ShuttingDown),
        }
    }

    /// Channel-only enqueue, used by the acceptor for forwarding copies.
    /// The task becomes durable the moment it first fails.
    pub fn enqueue(&self, mut task: SendTask) -> Result<TaskId, Fault> {
        task.max_retries = self.config.max_retries;
        let id = task.id;
        match self.tx.try_send(task) {
            Ok(()) => Ok(id),
            Err(TrySendError::Full(_)) => Err(Fault::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Fault::ShuttingDown),
        }
    }

    pub fn depth(&self) -> usize {
        self.config.capacity - self.tx.capacity()
    }

    /// Reload work that was pending when the process stopped. Tasks that do
    /// not fit the channel go to the retry store and come back through the
    /// sweeper.
    pub async fn replay_pending(&self) -> Result<usize, Fault> {
        let pending = tasks::pending_tasks(&self.db).await?;
        let mut replayed = 0;
        for mut task in pending {
            match self.tx.try_send(task.clone()) {
                Ok(()) => replayed += 1,
                Err(TrySendError::Full(_)) => {
                    task.status = TaskStatus::Retry;
                    task.not_before = Some(Timestamp::now());
                    tasks::upsert_task(&self.db, &task).await?;
                }
                Err(TrySendError::Closed(_)) => return Err(Fault::ShuttingDown),
            }
        }
        if replayed > 0 {
            tracing::info!(replayed, "replayed pending tasks");
        }
        Ok(replayed)
    }

    /// Move due retry-store entries back into the channel. Runs on the
    /// supervisor's 30 s ticker.
    pub async fn sweep_retries(&self) -> Result<usize, Fault> {
        let due = tasks::due_retries(&self.db, Timestamp::now()).await?;
        let mut requeued = 0;
        for mut task in due {
            task.status = TaskStatus::Pending;
            task.not_before = None;
            match self.tx.try_send(task.clone()) {
                Ok(()) => {
                    tasks::upsert_task(&self.db, &task).await?;
                    requeued += 1;
                }
                // No room; the rest stay in the retry store for the next
                // sweep.
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => return Err(Fault::ShuttingDown),
            }
        }
        if requeued > 0 {
            tracing::debug!(requeued, "retry sweep requeued tasks");
        }
        Ok(requeued)
    }

    /// Drop dead letters older than the retention window.
    pub async fn sweep_dead_letters(&self) -> Result<u64, Fault> {
        let cutoff = Timestamp(
            Timestamp::now()
                .0
                .saturating_sub(self.config.dead_letter_retention_secs),
        );
        let purged = tasks::purge_dead_letters(&self.db, cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "dead letters past retention removed");
        }
        Ok(purged)
    }

    pub async fn depths(&self) -> Result<QueueDepths, Fault> {
        Ok(QueueDepths {
            channel: self.depth(),
            channel_capacity: self.config.capacity,
            retry: tasks::count_by_status(&self.db, TaskStatus::Retry).await?,
            dead_letter: tasks::dead_letters(&self.db).await?.len() as u64,
        })
    }
}
