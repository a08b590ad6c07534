//! The inbound acceptance path: match the recipient to a local mailbox,
//! apply its forwarding rule, store an encrypted copy and/or enqueue an
//! outgoing task.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::watch;
use pelican_crypt::seal::Sealer;
use pelican_structs::fault::Fault;
use pelican_structs::header::headers_to_json;
use pelican_structs::message::{InboundMessage, MessageId, StoredMessage};
use pelican_structs::task::{SendTask, TaskId, TaskKind};
use pelican_structs::timestamp::{NanoTimestamp, Timestamp};

use crate::backends::Backends;
use crate::directory::MailboxDirectory;
use crate::queue::SendQueue;
use crate::store::messages;

/// What happened to an accepted message.
#[derive(Clone, Debug, Serialize)]
pub struct AcceptOutcome {
    pub stored: Option<MessageId>,
    pub forwarded: Option<TaskId>,
}

pub struct Acceptor {
    db: SqlitePool,
    directory: Arc<MailboxDirectory>,
    queue: Arc<SendQueue>,
    sealer: Arc<Sealer>,
    backends: Arc<Backends>,
    shutdown: watch::Receiver<bool>,
}

impl Acceptor {
    pub fn new(
        db: SqlitePool,
        directory: Arc<MailboxDirectory>,
        queue: Arc<SendQueue>,
        sealer: Arc<Sealer>,
        backends: Arc<Backends>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            directory,
            queue,
            sealer,
            backends,
            shutdown,
        }
    }

    /// Accept one delivered message. Success means every required store and
    /// enqueue was acknowledged; delivery of a forwarded copy is not
    /// awaited.
    pub async fn accept(&self, message: InboundMessage) -> Result<AcceptOutcome, Fault> {
        if *self.shutdown.borrow() {
            return Err(Fault::ShuttingDown);
        }
        // Addresses are normalized at parse time; the lookup is therefore
        // case-insensitive.
        let mailbox = self
            .directory
            .lookup(&message.recipient)
            .await?
            .filter(|mailbox| mailbox.active)
            .ok_or_else(|| {
                tracing::debug!(recipient = %message.recipient, "no active mailbox for recipient");
                Fault::UnknownRecipient
            })?;

        let mut outcome = AcceptOutcome {
            stored: None,
            forwarded: None,
        };

        let forward_target = mailbox
            .forward_enabled
            .then_some(mailbox.forward_to.as_ref())
            .flatten();

        if let Some(target) = forward_target {
            let task = SendTask::new(
                TaskKind::Outgoing,
                message.sender.clone(),
                vec![target.clone()],
                message.subject.clone(),
                message.body.clone(),
            )
            .with_headers(message.headers.clone());
            if mailbox.keep_original {
                // The local copy below still succeeds; a full queue only
                // costs the forwarded copy.
                match self.queue.enqueue(task) {
                    Ok(id) => outcome.forwarded = Some(id),
                    Err(fault) => {
                        tracing::warn!(
                            mailbox = %mailbox.email,
                            code = fault.code(),
                            "forwarding copy dropped"
                        );
                    }
                }
            } else {
                // Forward-only: the outgoing task is the only delivery, so
                // the caller must see a full queue and retry.
                outcome.forwarded = Some(self.queue.enqueue(task)?);
            }
        }

        if !mailbox.forward_enabled || mailbox.keep_original {
            outcome.stored = Some(self.store_local(&message).await?);
        }

        tracing::debug!(
            recipient = %message.recipient,
            stored = outcome.stored.map(|id| id.to_string()).unwrap_or_default(),
            forwarded = outcome.forwarded.map(|id| id.to_string()).unwrap_or_default(),
            "message accepted"
        );
        Ok(outcome)
    }

    async fn store_local(&self, message: &InboundMessage) -> Result<MessageId, Fault> {
        let sealed = self
            .sealer
            .seal_message(
                &message.subject,
                &message.body,
                &headers_to_json(&message.headers),
            )
            .map_err(|err| Fault::ValidationFailed(err.to_string()))?;
        let record = StoredMessage {
            id: MessageId::random(),
            mailbox: message.recipient.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            received_at: NanoTimestamp::now(),
            sealed,
            encrypted_at: Timestamp::now(),
        };
        let _permit = self.backends.store_permit().await?;
        messages::put_message(&self.db, &record).await?;
        Ok(record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, QueueConfig};
    use crate::store::testing::memory_pool;
    use pelican_structs::address::EmailAddress;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).expect("addr")
    }

    struct Fixture {
        acceptor: Acceptor,
        directory: Arc<MailboxDirectory>,
        queue: Arc<SendQueue>,
        db: SqlitePool,
        task_rx: tokio::sync::mpsc::Receiver<SendTask>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn fixture(queue_capacity: usize) -> Fixture {
        let db = memory_pool().await;
        let backends = Arc::new(Backends::new(db.clone(), &PoolConfig::default()));
        let directory = Arc::new(MailboxDirectory::new(db.clone(), backends.mailbox_cache()));
        let (queue, task_rx) = SendQueue::new(
            db.clone(),
            QueueConfig {
                capacity: queue_capacity,
                ..QueueConfig::default()
            },
        );
        let queue = Arc::new(queue);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = Acceptor::new(
            db.clone(),
            directory.clone(),
            queue.clone(),
            Arc::new(Sealer::new([7u8; 32])),
            backends,
            shutdown_rx,
        );
        Fixture {
            acceptor,
            directory,
            queue,
            db,
            task_rx,
            shutdown_tx,
        }
    }

    /// Occupy every slot of the processing channel.
    fn fill_queue(fixture: &Fixture) {
        loop {
            let filler = SendTask::new(
                TaskKind::Outgoing,
                addr("filler@d.test"),
                vec![addr("x@e.test")],
                "filler",
                "filler",
            );
            if fixture.queue.enqueue(filler).is_err() {
                break;
            }
        }
    }

    fn inbound(recipient: &str) -> InboundMessage {
        InboundMessage {
            sender: addr("someone@e.test"),
            recipient: addr(recipient),
            subject: "a subject".into(),
            body: "a body".into(),
            headers: Vec::new(),
        }
    }

    async fn create_mailbox(fixture: &Fixture, email: &str) {
        fixture
            .directory
            .create_mailbox(&addr(email), "Mailbox.Pass1", "", &addr("owner@d.test"))
            .await
            .expect("create mailbox");
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected() {
        let fixture = fixture(4).await;
        let err = fixture
            .acceptor
            .accept(inbound("ghost@d.test"))
            .await
            .expect_err("unknown");
        assert_eq!(err, Fault::UnknownRecipient);
    }

    #[tokio::test]
    async fn plain_delivery_stores_an_encrypted_copy() {
        let fixture = fixture(4).await;
        create_mailbox(&fixture, "box01@d.test").await;

        let outcome = fixture
            .acceptor
            .accept(inbound("box01@d.test"))
            .await
            .expect("accept");
        assert!(outcome.stored.is_some());
        assert!(outcome.forwarded.is_none());
        let stored = messages::list_messages(&fixture.db, &addr("box01@d.test"), 10, 0)
            .await
            .expect("list");
        assert_eq!(stored.len(), 1);
        // Nothing went to the queue.
        assert_eq!(fixture.queue.depth(), 0);
    }

    #[tokio::test]
    async fn recipient_case_is_normalized() {
        let fixture = fixture(4).await;
        create_mailbox(&fixture, "box01@d.test").await;
        let outcome = fixture
            .acceptor
            .accept(inbound("Box01@D.TEST"))
            .await
            .expect("accept");
        assert!(outcome.stored.is_some());
    }

    #[tokio::test]
    async fn forward_with_keep_original_stores_and_enqueues() {
        let mut fixture = fixture(4).await;
        create_mailbox(&fixture, "a.box@d.test").await;
        fixture
            .directory
            .update_forwarding(&addr("a.box@d.test"), Some(&addr("b@e.test")), true, true)
            .await
            .expect("rule");

        let outcome = fixture
            .acceptor
            .accept(inbound("a.box@d.test"))
            .await
            .expect("accept");
        assert!(outcome.stored.is_some());
        assert!(outcome.forwarded.is_some());

        let stored = messages::list_messages(&fixture.db, &addr("a.box@d.test"), 10, 0)
            .await
            .expect("list");
        assert_eq!(stored.len(), 1);

        let task = fixture.task_rx.recv().await.expect("outgoing task");
        assert_eq!(task.kind, TaskKind::Outgoing);
        assert_eq!(task.recipients, vec![addr("b@e.test")]);
        assert_eq!(task.sender, addr("someone@e.test"));
    }

    #[tokio::test]
    async fn forward_only_skips_the_local_copy() {
        let mut fixture = fixture(4).await;
        create_mailbox(&fixture, "a.box@d.test").await;
        fixture
            .directory
            .update_forwarding(&addr("a.box@d.test"), Some(&addr("b@e.test")), true, false)
            .await
            .expect("rule");

        let outcome = fixture
            .acceptor
            .accept(inbound("a.box@d.test"))
            .await
            .expect("accept");
        assert!(outcome.stored.is_none());
        assert!(outcome.forwarded.is_some());
        assert!(
            messages::list_messages(&fixture.db, &addr("a.box@d.test"), 10, 0)
                .await
                .expect("list")
                .is_empty()
        );
        assert_eq!(
            fixture.task_rx.recv().await.expect("task").kind,
            TaskKind::Outgoing
        );
    }

    #[tokio::test]
    async fn full_queue_drops_the_copy_but_keeps_the_original() {
        let fixture = fixture(1).await;
        fill_queue(&fixture);
        create_mailbox(&fixture, "a.box@d.test").await;
        fixture
            .directory
            .update_forwarding(&addr("a.box@d.test"), Some(&addr("b@e.test")), true, true)
            .await
            .expect("rule");

        let outcome = fixture
            .acceptor
            .accept(inbound("a.box@d.test"))
            .await
            .expect("accept despite full queue");
        assert!(outcome.stored.is_some());
        assert!(outcome.forwarded.is_none());
    }

    #[tokio::test]
    async fn forward_only_with_full_queue_is_queue_full() {
        let fixture = fixture(1).await;
        fill_queue(&fixture);
        create_mailbox(&fixture, "a.box@d.test").await;
        fixture
            .directory
            .update_forwarding(&addr("a.box@d.test"), Some(&addr("b@e.test")), true, false)
            .await
            .expect("rule");

        let err = fixture
            .acceptor
            .accept(inbound("a.box@d.test"))
            .await
            .expect_err("queue full");
        assert_eq!(err, Fault::QueueFull);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let fixture = fixture(4).await;
        create_mailbox(&fixture, "box01@d.test").await;
        fixture.shutdown_tx.send(true).expect("signal");
        let err = fixture
            .acceptor
            .accept(inbound("box01@d.test"))
            .await
            .expect_err("shutting down");
        assert_eq!(err, Fault::ShuttingDown);
    }
}
