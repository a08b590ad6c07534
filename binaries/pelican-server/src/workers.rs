//! The worker pool: a fixed set of senders draining the processing channel,
//! publishing outcomes on a result channel. A separate result handler owns
//! every task-state transition, so workers never touch the store for
//! outgoing work.
//!
//! Outgoing tasks pass the rate limiter and the circuit breaker before the
//! transport is dialed; local-copy tasks seal and store the message for
//! each local recipient.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use pelican_crypt::seal::Sealer;
use pelican_relay::RelayTransport;
use pelican_structs::fault::Fault;
use pelican_structs::header::headers_to_json;
use pelican_structs::message::{MessageId, StoredMessage};
use pelican_structs::task::{SendTask, TaskKind, TaskStatus};
use pelican_structs::timestamp::{NanoTimestamp, Timestamp};

use crate::breaker::SharedBreaker;
use crate::metrics::{SendMetrics, WorkerSlots};
use crate::ratelimit::RateLimiter;
use crate::store::{mailboxes, messages, tasks};

/// Overall budget for one task execution; the transport's own dial and I/O
/// timeouts sit inside it.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop` waits for a worker past the task budget.
const STOP_GRACE: Duration = Duration::from_secs(35);

/// Everything a worker needs; shared across the pool.
pub struct WorkerContext {
    pub db: SqlitePool,
    pub transport: Arc<dyn RelayTransport>,
    pub breaker: Arc<SharedBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<SendMetrics>,
    pub slots: Arc<WorkerSlots>,
    pub sealer: Arc<Sealer>,
    pub retry_delay_secs: u64,
}

struct WorkerResult {
    worker_id: usize,
    task: SendTask,
    outcome: Result<(), Fault>,
    latency: Duration,
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    result_handler: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Start `count` workers plus the result handler. The worker count is
    /// fixed for the pool's lifetime.
    pub fn spawn(
        count: usize,
        task_rx: mpsc::Receiver<SendTask>,
        ctx: Arc<WorkerContext>,
    ) -> Self {
        let count = count.max(1);
        let (shutdown, _) = watch::channel(false);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::channel::<WorkerResult>(count * 2);

        let workers = (0..count)
            .map(|worker_id| {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let ctx = ctx.clone();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(worker_loop(worker_id, task_rx, result_tx, ctx, shutdown_rx))
            })
            .collect();
        drop(result_tx);

        let result_handler = tokio::spawn(result_loop(result_rx, ctx));
        tracing::info!(workers = count, "worker pool started");
        Self {
            workers,
            result_handler,
            shutdown,
        }
    }

    /// Bounded shutdown: workers finish their in-flight task (capped by the
    /// transport deadlines), publish its result, and exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for (id, handle) in self.workers.into_iter().enumerate() {
            if timeout(STOP_GRACE, handle).await.is_err() {
                tracing::warn!(worker = id, "worker did not stop within the grace period");
            }
        }
        if timeout(STOP_GRACE, self.result_handler).await.is_err() {
            tracing::warn!("result handler did not stop within the grace period");
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<SendTask>>>,
    result_tx: mpsc::Sender<WorkerResult>,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = {
            let mut rx = task_rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = next else { break };

        ctx.slots.set_in_flight(worker_id, Some(task.id.to_string()));
        let started = Instant::now();
        let outcome = execute(&ctx, &task).await;
        let latency = started.elapsed();
        let result = WorkerResult {
            worker_id,
            task,
            outcome,
            latency,
        };
        if result_tx.send(result).await.is_err() {
            break;
        }
    }
    tracing::debug!(worker = worker_id, "worker exited");
}

async fn execute(ctx: &WorkerContext, task: &SendTask) -> Result<(), Fault> {
    match task.kind {
        TaskKind::Outgoing => execute_outgoing(ctx, task).await,
        TaskKind::IncomingLocalCopy => execute_local_copy(ctx, task).await,
    }
}

async fn execute_outgoing(ctx: &WorkerContext, task: &SendTask) -> Result<(), Fault> {
    if !ctx.limiter.check(task.sender.as_str(), Instant::now()) {
        return Err(Fault::RateLimited);
    }
    if !ctx.breaker.admit() {
        return Err(Fault::BreakerOpen);
    }
    match timeout(TASK_TIMEOUT, ctx.transport.send_task(task)).await {
        Ok(Ok(())) => {
            ctx.breaker.record_success();
            Ok(())
        }
        Ok(Err(relay_err)) => {
            ctx.breaker.record_failure();
            Err(relay_err.into())
        }
        Err(_) => {
            ctx.breaker.record_failure();
            Err(Fault::TransportProtocol("task deadline exceeded".into()))
        }
    }
}

/// Seal the message and store one encrypted copy per local recipient.
async fn execute_local_copy(ctx: &WorkerContext, task: &SendTask) -> Result<(), Fault> {
    let sealed = ctx
        .sealer
        .seal_message(&task.subject, &task.body, &headers_to_json(&task.headers))
        .map_err(|err| Fault::ValidationFailed(err.to_string()))?;
    for recipient in &task.recipients {
        let mailbox = mailboxes::load_mailbox(&ctx.db, recipient)
            .await?
            .filter(|mailbox| mailbox.active)
            .ok_or(Fault::UnknownRecipient)?;
        let record = StoredMessage {
            id: MessageId::random(),
            mailbox: mailbox.email.clone(),
            sender: task.sender.clone(),
            recipient: recipient.clone(),
            received_at: NanoTimestamp::now(),
            sealed: sealed.clone(),
            encrypted_at: Timestamp::now(),
        };
        messages::put_message(&ctx.db, &record).await?;
    }
    Ok(())
}

/// Owns every task-state transition and the send counters.
async fn result_loop(mut result_rx: mpsc::Receiver<WorkerResult>, ctx: Arc<WorkerContext>) {
    while let Some(result) = result_rx.recv().await {
        let WorkerResult {
            worker_id,
            mut task,
            outcome,
            latency,
        } = result;
        match outcome {
            Ok(()) => {
                ctx.metrics.record_success(latency, Instant::now());
                ctx.slots.record_outcome(worker_id, true);
                task.status = TaskStatus::Completed;
                task.processed_at = Some(Timestamp::now());
                task.last_error = None;
                if let Err(err) = tasks::upsert_task(&ctx.db, &task).await {
                    tracing::error!(task = %task.id, %err, "failed to record completion");
                }
                tracing::debug!(task = %task.id, latency_ms = latency.as_millis() as u64, "task completed");
            }
            Err(fault) => {
                ctx.metrics.record_failure();
                ctx.slots.record_outcome(worker_id, false);
                task.retry_count += 1;
                task.last_error = Some(fault.to_string());
                if task.retry_count < task.max_retries {
                    task.status = TaskStatus::Retry;
                    task.not_before = Some(Timestamp::now().plus_secs(ctx.retry_delay_secs));
                    if let Err(err) = tasks::upsert_task(&ctx.db, &task).await {
                        tracing::error!(task = %task.id, %err, "failed to park task for retry");
                    }
                    tracing::warn!(
                        task = %task.id,
                        retry = task.retry_count,
                        code = fault.code(),
                        "task failed, parked for retry"
                    );
                } else {
                    task.status = TaskStatus::Failed;
                    task.processed_at = Some(Timestamp::now());
                    if let Err(err) =
                        tasks::move_to_dead_letter(&ctx.db, &task, Timestamp::now()).await
                    {
                        tracing::error!(task = %task.id, %err, "failed to dead-letter task");
                    }
                    tracing::warn!(
                        task = %task.id,
                        code = fault.code(),
                        "retries exhausted, task dead-lettered"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use pelican_relay::RelayError;
    use pelican_structs::address::EmailAddress;

    use crate::store::testing::memory_pool;

    /// Transport that fails the first `failures` calls, then succeeds.
    struct FlakyTransport {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RelayTransport for FlakyTransport {
        async fn send_task(&self, _task: &SendTask) -> Result<(), RelayError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RelayError::Dial("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).expect("addr")
    }

    fn outgoing(sender: &str) -> SendTask {
        SendTask::new(
            TaskKind::Outgoing,
            addr(sender),
            vec![addr("x@e.test")],
            "hi",
            "h",
        )
    }

    async fn context(
        db: SqlitePool,
        transport: Arc<dyn RelayTransport>,
        limit: usize,
    ) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            db,
            transport,
            breaker: Arc::new(SharedBreaker::new()),
            limiter: Arc::new(RateLimiter::new(limit, Duration::from_secs(60))),
            metrics: Arc::new(SendMetrics::new()),
            slots: Arc::new(WorkerSlots::new(2)),
            sealer: Arc::new(Sealer::new([7u8; 32])),
            retry_delay_secs: 300,
        })
    }

    async fn wait_for_terminal(db: &SqlitePool, id: &pelican_structs::task::TaskId) -> SendTask {
        for _ in 0..200 {
            if let Some(task) = tasks::load_task(db, id).await.expect("load")
                && task.status.is_terminal()
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached a terminal state");
    }

    async fn wait_for_status(
        db: &SqlitePool,
        id: &pelican_structs::task::TaskId,
        status: TaskStatus,
    ) -> SendTask {
        for _ in 0..200 {
            if let Some(task) = tasks::load_task(db, id).await.expect("load")
                && task.status == status
            {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached {status:?}");
    }

    #[tokio::test]
    async fn successful_send_completes_the_task() {
        let db = memory_pool().await;
        let transport = Arc::new(FlakyTransport::new(0));
        let ctx = context(db.clone(), transport.clone(), 100).await;
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(2, rx, ctx.clone());

        let task = outgoing("admin@d.test");
        let id = task.id;
        tasks::upsert_task(&db, &task).await.expect("persist");
        tx.send(task).await.expect("send");

        let done = wait_for_terminal(&db, &id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retry_count, 0);
        assert!(done.processed_at.is_some());
        assert_eq!(transport.calls(), 1);
        assert_eq!(ctx.metrics.snapshot(Instant::now()).total_sent, 1);
        let (state, _) = ctx.breaker.snapshot();
        assert_eq!(state, crate::breaker::BreakerState::Closed);
        pool.stop().await;
    }

    #[tokio::test]
    async fn transient_failure_parks_the_task_for_retry() {
        let db = memory_pool().await;
        let ctx = context(db.clone(), Arc::new(FlakyTransport::new(1)), 100).await;
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(1, rx, ctx);
        let task = outgoing("admin@d.test");
        let id = task.id;
        tx.send(task).await.expect("send");

        let parked = wait_for_status(&db, &id, TaskStatus::Retry).await;
        assert_eq!(parked.retry_count, 1);
        let not_before = parked.not_before.expect("not-before set");
        assert!(not_before.0 >= Timestamp::now().0 + 200);
        assert!(tasks::dead_letters(&db).await.expect("dead letters").is_empty());
        pool.stop().await;
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_the_dead_letter_store() {
        let db = memory_pool().await;
        let ctx = context(db.clone(), Arc::new(FlakyTransport::new(10)), 100).await;
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(1, rx, ctx);

        let mut task = outgoing("admin@d.test");
        task.retry_count = task.max_retries - 1;
        let id = task.id;
        tx.send(task).await.expect("send");

        for _ in 0..200 {
            if !tasks::dead_letters(&db).await.expect("list").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let dead = tasks::dead_letters(&db).await.expect("list");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].status, TaskStatus::Failed);
        assert!(tasks::load_task(&db, &id).await.expect("load").is_none());
        pool.stop().await;
    }

    #[tokio::test]
    async fn breaker_opens_after_five_failures_and_skips_the_transport() {
        let db = memory_pool().await;
        let transport = Arc::new(FlakyTransport::new(100));
        let ctx = context(db.clone(), transport.clone(), 100).await;
        let (tx, rx) = mpsc::channel(16);
        let pool = WorkerPool::spawn(1, rx, ctx.clone());

        let mut ids = Vec::new();
        for _ in 0..6 {
            let task = outgoing("admin@d.test");
            ids.push(task.id);
            tx.send(task).await.expect("send");
        }
        for id in &ids {
            wait_for_status(&db, id, TaskStatus::Retry).await;
        }
        // Five transport dials opened the breaker; the sixth was rejected
        // without dialing.
        assert_eq!(transport.calls(), 5);
        let (state, failures) = ctx.breaker.snapshot();
        assert_eq!(state, crate::breaker::BreakerState::Open);
        assert_eq!(failures, 5);
        let sixth = tasks::load_task(&db, &ids[5]).await.expect("load").expect("present");
        assert_eq!(sixth.last_error.as_deref(), Some("circuit breaker is open"));
        pool.stop().await;
    }

    #[tokio::test]
    async fn rate_limited_sender_is_rejected_before_the_transport() {
        let db = memory_pool().await;
        let transport = Arc::new(FlakyTransport::new(0));
        let ctx = context(db.clone(), transport.clone(), 2).await;
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(1, rx, ctx);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = outgoing("busy@d.test");
            ids.push(task.id);
            tx.send(task).await.expect("send");
        }
        wait_for_terminal(&db, &ids[0]).await;
        wait_for_terminal(&db, &ids[1]).await;
        let third = wait_for_status(&db, &ids[2], TaskStatus::Retry).await;
        assert_eq!(third.last_error.as_deref(), Some("rate limit exceeded"));
        assert_eq!(transport.calls(), 2);
        pool.stop().await;
    }

    #[tokio::test]
    async fn local_copy_task_stores_an_encrypted_record() {
        let db = memory_pool().await;
        let ctx = context(db.clone(), Arc::new(FlakyTransport::new(0)), 100).await;
        let mailbox = crate::store::mailboxes::MailboxRecord {
            email: addr("inbox01@d.test"),
            password_hash: vec![1; 32],
            salt: vec![2; 16],
            description: String::new(),
            owner: addr("owner@d.test"),
            active: true,
            forward_to: None,
            forward_enabled: false,
            keep_original: true,
            created_at: Timestamp::now(),
        };
        mailboxes::insert_mailbox(&db, &mailbox).await.expect("mailbox");

        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(1, rx, ctx.clone());
        let task = SendTask::new(
            TaskKind::IncomingLocalCopy,
            addr("sender@e.test"),
            vec![addr("inbox01@d.test")],
            "stored subject",
            "stored body",
        );
        let id = task.id;
        tx.send(task).await.expect("send");

        let done = wait_for_terminal(&db, &id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        let stored = messages::list_messages(&db, &addr("inbox01@d.test"), 10, 0)
            .await
            .expect("list");
        assert_eq!(stored.len(), 1);
        let open = ctx.sealer.open_message(&stored[0].sealed).expect("open");
        assert_eq!(open.subject, "stored subject");
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_is_bounded_and_workers_exit() {
        let db = memory_pool().await;
        let ctx = context(db.clone(), Arc::new(FlakyTransport::new(0)), 100).await;
        let (tx, rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(4, rx, ctx);

        let stopped = timeout(Duration::from_secs(5), pool.stop()).await;
        assert!(stopped.is_ok(), "stop() must be bounded");
        // The channel is still open but nobody is draining it.
        drop(tx);
    }
}
