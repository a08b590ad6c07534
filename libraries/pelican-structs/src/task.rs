use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::{Bytes, IfIsHumanReadable, serde_as};
use thiserror::Error;

use crate::address::EmailAddress;
use crate::header::{Attachment, Header};
use crate::timestamp::Timestamp;

/// Default retry budget for a send task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Identifier of one send task; also used in the outgoing `Message-ID`.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct TaskId(#[serde_as(as = "IfIsHumanReadable<Hex, Bytes>")] [u8; 16]);

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid task id")]
pub struct TaskIdError;

impl TaskId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TaskIdError)?;
        let buf: [u8; 16] = bytes.try_into().map_err(|_| TaskIdError)?;
        Ok(Self(buf))
    }
}

/// Which logical queue a task belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A local encrypted copy of a delivered message.
    IncomingLocalCopy,
    /// A message bound for the upstream relay.
    Outgoing,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IncomingLocalCopy => "incoming_local_copy",
            TaskKind::Outgoing => "outgoing",
        }
    }
}

/// Task lifecycle. `Completed` and `Failed` are terminal; a terminal task is
/// never re-queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Retry,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Retry => "retry",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "retry" => Some(TaskStatus::Retry),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Dispatch priority within a logical queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_i64(&self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// One unit of work for the send pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendTask {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub sender: EmailAddress,
    pub recipients: Vec<EmailAddress>,
    pub subject: String,
    pub body: String,
    pub headers: Vec<Header>,
    pub attachments: Vec<Attachment>,
    pub created_at: Timestamp,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub not_before: Option<Timestamp>,
    pub processed_at: Option<Timestamp>,
}

impl SendTask {
    pub fn new(
        kind: TaskKind,
        sender: EmailAddress,
        recipients: Vec<EmailAddress>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::random(),
            kind,
            priority: Priority::Normal,
            sender,
            recipients,
            subject: subject.into(),
            body: body.into(),
            headers: Vec::new(),
            attachments: Vec::new(),
            created_at: Timestamp::now(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            not_before: None,
            processed_at: None,
        }
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> EmailAddress {
        EmailAddress::parse(s).expect("valid address")
    }

    #[test]
    fn new_task_starts_pending() {
        let task = SendTask::new(
            TaskKind::Outgoing,
            addr("a@d.test"),
            vec![addr("b@e.test")],
            "hi",
            "body",
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Retry,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn task_id_roundtrips_through_hex() {
        let id = TaskId::random();
        let parsed: TaskId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
    }
}
