//! Getting stored direct messages to their receivers, and receipts back to senders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Message, ReceiptStatus};
use crate::queue::{
    DeliveryJob, DeliveryReceiptJob, EnqueueOutcome, JobEnvelope, JobFailure, JobHandler,
    JobQueue, QueueJob, QueueStats, DELIVERY_QUEUE, RECEIPT_QUEUE,
};
use crate::repository::MessagingStore;
use crate::services::push::PushNotifier;
use crate::websocket::{AckOutcome, LiveChannel, ReceiptNotice, ServerEvent};

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsReport {
    pub delivery: QueueStats,
    pub receipts: QueueStats,
}

/// Live push with ack, falling back to the offline queue
pub struct DeliveryService {
    store: Arc<dyn MessagingStore>,
    live: LiveChannel,
    delivery_queue: Arc<dyn JobQueue>,
    receipt_queue: Arc<dyn JobQueue>,
    push: Arc<dyn PushNotifier>,
    initial_delay: Duration,
    delivery_wake: Arc<Notify>,
    receipt_wake: Arc<Notify>,
}

impl DeliveryService {
    pub fn new(
        store: Arc<dyn MessagingStore>,
        live: LiveChannel,
        delivery_queue: Arc<dyn JobQueue>,
        receipt_queue: Arc<dyn JobQueue>,
        push: Arc<dyn PushNotifier>,
        cfg: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            live,
            delivery_queue,
            receipt_queue,
            push,
            initial_delay: cfg.initial_delay,
            delivery_wake: Arc::new(Notify::new()),
            receipt_wake: Arc::new(Notify::new()),
        }
    }

    pub fn delivery_queue(&self) -> Arc<dyn JobQueue> {
        self.delivery_queue.clone()
    }

    pub fn receipt_queue(&self) -> Arc<dyn JobQueue> {
        self.receipt_queue.clone()
    }

    pub fn delivery_wake(&self) -> Arc<Notify> {
        self.delivery_wake.clone()
    }

    pub fn receipt_wake(&self) -> Arc<Notify> {
        self.receipt_wake.clone()
    }

    /// Start delivering a freshly stored direct message.
    ///
    /// Runs detached: the send has already succeeded and nothing here can fail it.
    pub fn dispatch(self: &Arc<Self>, message: Message) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.deliver_now(message).await })
    }

    async fn deliver_now(&self, message: Message) {
        let Some(receiver_id) = message.receiver_id else {
            return;
        };

        let outcome = self.live.deliver_with_ack(receiver_id, &message).await;
        metrics::record_live_push(outcome.as_str());
        if outcome == AckOutcome::Acked {
            debug!(message_id = %message.id, "delivered live");
            return;
        }

        debug!(
            message_id = %message.id,
            receiver_id = %receiver_id,
            outcome = outcome.as_str(),
            "live delivery failed, queueing"
        );
        if let Err(e) = self.enqueue_delivery(&message, self.initial_delay).await {
            error!(message_id = %message.id, error = %e, "failed to queue offline delivery");
        }
    }

    /// Park a delivery job. Idempotent per message id.
    pub async fn enqueue_delivery(
        &self,
        message: &Message,
        delay: Duration,
    ) -> AppResult<EnqueueOutcome> {
        let job = DeliveryJob::for_message(message).ok_or_else(|| {
            AppError::InvalidOperation("only direct messages are queued".into())
        })?;
        let receiver_id = job.receiver_id;

        let outcome = self
            .delivery_queue
            .enqueue(JobEnvelope::new(QueueJob::Delivery(job)), delay)
            .await?;

        if outcome == EnqueueOutcome::Enqueued {
            let push = self.push.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = push.notify_offline(receiver_id, &message).await {
                    warn!(message_id = %message.id, error = %e, "push notification failed");
                }
            });
        }
        Ok(outcome)
    }

    pub async fn enqueue_receipt(
        &self,
        message_id: Uuid,
        receiver_id: Uuid,
        status: ReceiptStatus,
        timestamp: DateTime<Utc>,
    ) -> AppResult<EnqueueOutcome> {
        let job = QueueJob::Receipt(DeliveryReceiptJob {
            message_id,
            receiver_id,
            status,
            timestamp,
        });
        let outcome = self
            .receipt_queue
            .enqueue(JobEnvelope::new(job), Duration::ZERO)
            .await?;
        self.receipt_wake.notify_one();
        Ok(outcome)
    }

    /// `message:ack:delivered` from the receiver
    pub async fn acknowledge(&self, user_id: Uuid, message_id: Uuid) -> AppResult<()> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if message.receiver_id != Some(user_id) {
            return Err(AppError::Forbidden);
        }

        self.live.acks().resolve(message_id, user_id);
        if message.delivered_at.is_none() {
            self.enqueue_receipt(message_id, user_id, ReceiptStatus::Delivered, Utc::now())
                .await?;
        }
        Ok(())
    }

    /// Make the user's parked deliveries due now and wake the worker
    pub async fn flush_for_user(&self, user_id: Uuid) -> AppResult<u64> {
        let moved = self.delivery_queue.promote_for_user(user_id).await?;
        if moved > 0 {
            info!(user_id = %user_id, moved, "flushing queued deliveries");
            self.delivery_wake.notify_one();
        }
        Ok(moved)
    }

    pub async fn queue_stats(&self) -> AppResult<QueueStatsReport> {
        let delivery = self.delivery_queue.stats().await?;
        let receipts = self.receipt_queue.stats().await?;
        metrics::set_queue_depth(DELIVERY_QUEUE, &delivery);
        metrics::set_queue_depth(RECEIPT_QUEUE, &receipts);
        Ok(QueueStatsReport { delivery, receipts })
    }

    pub async fn dead_letters(&self, limit: usize) -> AppResult<Vec<JobEnvelope>> {
        let mut out = self.delivery_queue.dead_letters(limit).await?;
        out.extend(self.receipt_queue.dead_letters(limit).await?);
        out.sort_by(|a, b| dead_at(b).cmp(&dead_at(a)));
        out.truncate(limit);
        Ok(out)
    }
}

fn dead_at(envelope: &JobEnvelope) -> Option<DateTime<Utc>> {
    match &envelope.job {
        QueueJob::DeadLetter(job) => Some(job.failed_at),
        _ => None,
    }
}

/// Client-caused or missing-data failures are not worth retrying
fn classify(err: AppError) -> JobFailure {
    match err {
        AppError::NotFound
        | AppError::Forbidden
        | AppError::InvalidOperation(_)
        | AppError::BadRequest(_) => JobFailure::Abandon(err),
        other => JobFailure::Retry(other),
    }
}

/// Attempts queued deliveries
pub struct DeliveryHandler {
    store: Arc<dyn MessagingStore>,
    live: LiveChannel,
}

impl DeliveryHandler {
    pub fn new(store: Arc<dyn MessagingStore>, live: LiveChannel) -> Self {
        Self { store, live }
    }
}

#[async_trait]
impl JobHandler for DeliveryHandler {
    async fn handle(&self, job: &QueueJob, attempt: u32) -> Result<(), JobFailure> {
        let QueueJob::Delivery(job) = job else {
            return Err(JobFailure::Abandon(AppError::InvalidOperation(format!(
                "{} job on delivery queue",
                job.kind()
            ))));
        };

        let message = self
            .store
            .get_message(job.message_id)
            .await
            .map_err(classify)?
            .ok_or(JobFailure::Abandon(AppError::NotFound))?;

        if message.delivered_at.is_some() || message.is_deleted() {
            debug!(message_id = %message.id, "nothing left to deliver");
            return Ok(());
        }

        let outcome = self.live.deliver_with_ack(job.receiver_id, &message).await;
        metrics::record_live_push(outcome.as_str());
        match outcome {
            AckOutcome::Acked => {
                info!(message_id = %message.id, attempt, "queued message delivered");
                Ok(())
            }
            other => Err(JobFailure::Retry(AppError::TransientDeliveryFailure(
                format!("receiver {} {}", job.receiver_id, other.as_str()),
            ))),
        }
    }
}

/// Applies receipts and tells the sender
pub struct ReceiptHandler {
    store: Arc<dyn MessagingStore>,
    live: LiveChannel,
}

impl ReceiptHandler {
    pub fn new(store: Arc<dyn MessagingStore>, live: LiveChannel) -> Self {
        Self { store, live }
    }
}

#[async_trait]
impl JobHandler for ReceiptHandler {
    async fn handle(&self, job: &QueueJob, _attempt: u32) -> Result<(), JobFailure> {
        let QueueJob::Receipt(job) = job else {
            return Err(JobFailure::Abandon(AppError::InvalidOperation(format!(
                "{} job on receipt queue",
                job.kind()
            ))));
        };

        let updated = match job.status {
            ReceiptStatus::Delivered => self.store.mark_delivered(job.message_id, job.timestamp).await,
            ReceiptStatus::Read => self.store.mark_read(job.message_id, job.timestamp).await,
        }
        .map_err(classify)?;
        let message = updated.ok_or(JobFailure::Abandon(AppError::NotFound))?;

        if job.status == ReceiptStatus::Read {
            if let (Some(conversation_id), Some(sequence)) =
                (message.conversation_id, message.sequence_number)
            {
                self.store
                    .advance_read_pointer(conversation_id, job.receiver_id, sequence)
                    .await
                    .map_err(classify)?;
            }
        }

        // the stored status wins, so a late `delivered` never downgrades `read`
        let Some(status) = message.receipt_status() else {
            return Ok(());
        };
        let at = match status {
            ReceiptStatus::Read => message.read_at,
            ReceiptStatus::Delivered => message.delivered_at,
        }
        .unwrap_or(job.timestamp);

        let notice = ServerEvent::MessageReceipt(ReceiptNotice {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sequence_number: message.sequence_number,
            status,
            reader_id: job.receiver_id,
            at,
        });
        self.live.push(message.sender_id, &notice).await;
        Ok(())
    }
}
