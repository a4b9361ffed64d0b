//! Durable work queues for offline delivery and receipts.
//!
//! Jobs move `queued -> attempting -> {delivered, retrying, dead}`. A job is
//! parked in the delayed set until due, leased while a worker attempts it,
//! then completed, rescheduled, or moved to the dead-letter list.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AppResult;

pub mod backoff;
pub mod job;
pub mod memory;
pub mod redis_queue;
pub mod worker;

pub use backoff::Backoff;
pub use job::{DeadLetterJob, DeliveryJob, DeliveryReceiptJob, JobEnvelope, QueueJob};
pub use memory::MemoryJobQueue;
pub use redis_queue::RedisJobQueue;
pub use worker::{JobFailure, JobHandler, QueueWorker};

pub const DELIVERY_QUEUE: &str = "delivery";
pub const RECEIPT_QUEUE: &str = "receipts";
/// Dead-letter lists keep only the newest entries
pub const MAX_DEAD_LETTERS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with the same id is already pending; nothing changed
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Waiting for their due time
    pub queued: u64,
    /// Leased by a worker
    pub active: u64,
    pub dead: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Park a job until `delay` has passed. Duplicate ids are a no-op.
    async fn enqueue(&self, envelope: JobEnvelope, delay: Duration) -> AppResult<EnqueueOutcome>;

    /// Lease up to `limit` due jobs for `lease`.
    ///
    /// Jobs whose lease ran out (a worker died mid-attempt) become due again.
    async fn reserve_due(&self, limit: usize, lease: Duration) -> AppResult<Vec<JobEnvelope>>;

    /// Remove a finished job.
    async fn complete(&self, envelope: &JobEnvelope) -> AppResult<()>;

    /// Store the updated envelope and park it for another `delay`.
    async fn retry_later(&self, envelope: &JobEnvelope, delay: Duration) -> AppResult<()>;

    /// Remove the job from the active queue and append it to the dead-letter list.
    async fn dead_letter(&self, envelope: JobEnvelope, reason: String) -> AppResult<JobEnvelope>;

    /// Make every parked job addressed to `user_id` due now. Returns how many moved.
    async fn promote_for_user(&self, user_id: Uuid) -> AppResult<u64>;

    async fn stats(&self) -> AppResult<QueueStats>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> AppResult<Vec<JobEnvelope>>;
}
