use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Backoff, JobEnvelope, JobQueue, QueueJob};
use crate::config::DeliveryConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;

/// How a failed attempt should be treated
#[derive(Debug)]
pub enum JobFailure {
    /// Try again after backoff, unless the attempt budget is spent
    Retry(AppError),
    /// Retrying cannot help (e.g. the message no longer exists)
    Abandon(AppError),
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// `attempt` is 1-based
    async fn handle(&self, job: &QueueJob, attempt: u32) -> Result<(), JobFailure>;
}

/// Polls one queue and runs due jobs with bounded concurrency
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    backoff: Backoff,
    max_attempts: u32,
    poll_interval: Duration,
    lease: Duration,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        cfg: &DeliveryConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            handler,
            backoff: Backoff::from_config(cfg),
            max_attempts: cfg.max_attempts.max(1),
            poll_interval: cfg.poll_interval,
            lease: cfg.lease,
            permits: Arc::new(Semaphore::new(cfg.worker_concurrency.max(1))),
            wake,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = self.queue.name(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            max_attempts = self.max_attempts,
            "Queue worker starting"
        );

        while !*shutdown.borrow() {
            match self.dispatch_due().await {
                Ok(handles) if !handles.is_empty() => {
                    debug!(queue = self.queue.name(), count = handles.len(), "Dispatched jobs");
                }
                Ok(_) => {}
                Err(e) => error!(queue = self.queue.name(), error = %e, "Queue worker error"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(queue = self.queue.name(), "Queue worker stopped");
    }

    /// Run every job that is due right now and wait for all of them
    pub async fn drain_due(&self) -> AppResult<usize> {
        let handles = self.dispatch_due().await?;
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(queue = self.queue.name(), error = %e, "Job task panicked");
            }
        }
        Ok(count)
    }

    async fn dispatch_due(&self) -> AppResult<Vec<JoinHandle<()>>> {
        let available = self.permits.available_permits();
        if available == 0 {
            return Ok(Vec::new());
        }

        let jobs = self.queue.reserve_due(available, self.lease).await?;
        let mut handles = Vec::with_capacity(jobs.len());
        for envelope in jobs {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let queue = self.queue.clone();
            let handler = self.handler.clone();
            let backoff = self.backoff.clone();
            let max_attempts = self.max_attempts;
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process(queue, handler, backoff, max_attempts, envelope).await;
            }));
        }
        Ok(handles)
    }
}

async fn process(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    backoff: Backoff,
    max_attempts: u32,
    mut envelope: JobEnvelope,
) {
    let attempt = envelope.attempts + 1;
    let queue_name = queue.name().to_string();
    let message_id = envelope.job.message_id();

    let result = handler.handle(&envelope.job, attempt).await;
    envelope.attempts = attempt;

    match result {
        Ok(()) => {
            metrics::record_queue_job(&queue_name, "completed");
            debug!(queue = %queue_name, job_id = %envelope.id, attempt, "Job completed");
            if let Err(e) = queue.complete(&envelope).await {
                error!(queue = %queue_name, job_id = %envelope.id, error = %e, "Failed to complete job");
            }
        }
        Err(JobFailure::Retry(err)) if attempt < max_attempts => {
            let delay = backoff.delay_before(attempt + 1);
            metrics::record_queue_job(&queue_name, "retried");
            info!(
                queue = %queue_name,
                job_id = %envelope.id,
                message_id = %message_id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                reason = %err,
                "Job attempt failed, retrying"
            );
            envelope.last_error = Some(err.to_string());
            if let Err(e) = queue.retry_later(&envelope, delay).await {
                error!(queue = %queue_name, job_id = %envelope.id, error = %e, "Failed to reschedule job");
            }
        }
        Err(JobFailure::Retry(err)) | Err(JobFailure::Abandon(err)) => {
            let failure = AppError::PermanentDeliveryFailure(format!(
                "{} after {} attempt(s): {}",
                envelope.job.kind(),
                attempt,
                err
            ));
            metrics::record_queue_job(&queue_name, "dead");
            error!(
                queue = %queue_name,
                job_id = %envelope.id,
                message_id = %message_id,
                attempt,
                error = %failure,
                "Job moved to dead-letter queue"
            );
            envelope.last_error = Some(err.to_string());
            if let Err(e) = queue.dead_letter(envelope, failure.to_string()).await {
                error!(queue = %queue_name, error = %e, "Failed to dead-letter job");
            }
        }
    }
}
