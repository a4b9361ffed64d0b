use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{EnqueueOutcome, JobEnvelope, JobQueue, QueueStats, MAX_DEAD_LETTERS};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobEnvelope>,
    delayed: HashMap<String, Instant>,
    active: HashMap<String, Instant>,
    by_user: HashMap<Uuid, HashSet<String>>,
    dead: VecDeque<JobEnvelope>,
}

impl Inner {
    fn forget(&mut self, id: &str, receiver: Option<Uuid>) {
        self.jobs.remove(id);
        self.delayed.remove(id);
        self.active.remove(id);
        if let Some(receiver) = receiver {
            if let Some(ids) = self.by_user.get_mut(&receiver) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_user.remove(&receiver);
                }
            }
        }
    }
}

/// Process-local queue with the same semantics as the Redis queue.
///
/// Uses tokio's clock, so tests can pause and advance time.
pub struct MemoryJobQueue {
    name: String,
    inner: Mutex<Inner>,
}

impl MemoryJobQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| AppError::Queue("memory queue poisoned".into()))
    }

    /// Whether a job with this id is parked or leased
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.jobs.contains_key(id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, envelope: JobEnvelope, delay: Duration) -> AppResult<EnqueueOutcome> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&envelope.id) {
            return Ok(EnqueueOutcome::Duplicate);
        }
        let id = envelope.id.clone();
        if let Some(receiver) = envelope.job.receiver_id() {
            inner.by_user.entry(receiver).or_default().insert(id.clone());
        }
        inner.delayed.insert(id.clone(), Instant::now() + delay);
        inner.jobs.insert(id, envelope);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn reserve_due(&self, limit: usize, lease: Duration) -> AppResult<Vec<JobEnvelope>> {
        let mut inner = self.lock()?;
        let now = Instant::now();

        let expired: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            inner.active.remove(&id);
            inner.delayed.insert(id, now);
        }

        let mut due: Vec<(String, Instant)> = inner
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (id.clone(), *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);
        due.truncate(limit);

        let mut out = Vec::with_capacity(due.len());
        for (id, _) in due {
            inner.delayed.remove(&id);
            if let Some(envelope) = inner.jobs.get(&id).cloned() {
                inner.active.insert(id, now + lease);
                out.push(envelope);
            }
        }
        Ok(out)
    }

    async fn complete(&self, envelope: &JobEnvelope) -> AppResult<()> {
        self.lock()?
            .forget(&envelope.id, envelope.job.receiver_id());
        Ok(())
    }

    async fn retry_later(&self, envelope: &JobEnvelope, delay: Duration) -> AppResult<()> {
        let mut inner = self.lock()?;
        inner.active.remove(&envelope.id);
        inner
            .delayed
            .insert(envelope.id.clone(), Instant::now() + delay);
        inner.jobs.insert(envelope.id.clone(), envelope.clone());
        Ok(())
    }

    async fn dead_letter(&self, envelope: JobEnvelope, reason: String) -> AppResult<JobEnvelope> {
        let mut inner = self.lock()?;
        inner.forget(&envelope.id, envelope.job.receiver_id());
        let dead = envelope.into_dead_letter(&self.name, reason);
        inner.dead.push_front(dead.clone());
        inner.dead.truncate(MAX_DEAD_LETTERS);
        Ok(dead)
    }

    async fn promote_for_user(&self, user_id: Uuid) -> AppResult<u64> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let ids: Vec<String> = inner
            .by_user
            .get(&user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        let mut moved = 0;
        for id in ids {
            if let Some(at) = inner.delayed.get_mut(&id) {
                if *at > now {
                    *at = now;
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn stats(&self) -> AppResult<QueueStats> {
        let inner = self.lock()?;
        Ok(QueueStats {
            queued: inner.delayed.len() as u64,
            active: inner.active.len() as u64,
            dead: inner.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> AppResult<Vec<JobEnvelope>> {
        Ok(self.lock()?.dead.iter().take(limit).cloned().collect())
    }
}
