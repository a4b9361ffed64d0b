use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, ReceiptStatus};

/// Push a stored direct message to a receiver who was not reachable live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub conversation_id: Uuid,
    pub sequence_number: i64,
}

impl DeliveryJob {
    /// `None` for class messages, which are never queued
    pub fn for_message(message: &Message) -> Option<Self> {
        Some(Self {
            message_id: message.id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id?,
            conversation_id: message.conversation_id?,
            sequence_number: message.sequence_number?,
        })
    }
}

/// Delivered/read transition reported by the message's receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceiptJob {
    pub message_id: Uuid,
    pub receiver_id: Uuid,
    pub status: ReceiptStatus,
    pub timestamp: DateTime<Utc>,
}

/// A job that exhausted its attempts, kept for operator inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub queue: String,
    pub failed: Box<QueueJob>,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueJob {
    Delivery(DeliveryJob),
    DeadLetter(DeadLetterJob),
    Receipt(DeliveryReceiptJob),
}

impl QueueJob {
    /// Identity used for idempotent enqueue
    pub fn job_id(&self) -> String {
        match self {
            QueueJob::Delivery(job) => job.message_id.to_string(),
            QueueJob::Receipt(job) => format!("{}:{}", job.message_id, job.status.as_str()),
            QueueJob::DeadLetter(job) => format!("dead:{}", job.failed.job_id()),
        }
    }

    /// Jobs indexed by receiver so a reconnect can pull them forward
    pub fn receiver_id(&self) -> Option<Uuid> {
        match self {
            QueueJob::Delivery(job) => Some(job.receiver_id),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Uuid {
        match self {
            QueueJob::Delivery(job) => job.message_id,
            QueueJob::Receipt(job) => job.message_id,
            QueueJob::DeadLetter(job) => job.failed.message_id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueueJob::Delivery(_) => "delivery",
            QueueJob::DeadLetter(_) => "dead_letter",
            QueueJob::Receipt(_) => "receipt",
        }
    }
}

/// Queue bookkeeping around a job.
///
/// `attempts` counts finished attempts (the `retryCount` of a delivery job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: String,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub job: QueueJob,
}

impl JobEnvelope {
    pub fn new(job: QueueJob) -> Self {
        Self {
            id: job.job_id(),
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
            job,
        }
    }

    pub fn into_dead_letter(self, queue: &str, reason: String) -> JobEnvelope {
        let dead = QueueJob::DeadLetter(DeadLetterJob {
            queue: queue.to_string(),
            failed: Box::new(self.job),
            attempts: self.attempts,
            reason,
            failed_at: Utc::now(),
        });
        JobEnvelope {
            id: dead.job_id(),
            attempts: self.attempts,
            enqueued_at: self.enqueued_at,
            last_error: self.last_error,
            job: dead,
        }
    }
}
